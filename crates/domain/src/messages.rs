use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known message keys used by the engine itself.
pub mod keys {
    pub const WELCOME: &str = "welcome";
    pub const I_DIDNT_CATCH: &str = "iDidntCatch";
    pub const RETRY_PROMPT: &str = "retryPrompt";
    pub const CANCELLED: &str = "cancelled";
    pub const HELP: &str = "help";
    pub const STATUS: &str = "status";
    pub const CONFIRM_SWITCH: &str = "confirmSwitch";
    pub const REBOOT_REQUIRES_CONFIRM: &str = "rebootRequiresConfirm";
    pub const NETWORK_ERROR: &str = "networkError";
    pub const FINANCIAL_ABORTED: &str = "financialAborted";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Localized message templates: locale → key → template.
///
/// Lookup falls back locale → `"en"` → the key itself, so the engine
/// always has something to render. Templates go through the template
/// renderer with a context the emitting site supplies (e.g. `flow`,
/// `prompt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRegistry {
    locales: HashMap<String, HashMap<String, String>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        let mut en = HashMap::new();
        let defaults: &[(&str, &str)] = &[
            (keys::WELCOME, "Hello! How can I help you today?"),
            (keys::I_DIDNT_CATCH, "I didn't catch that. Could you rephrase?"),
            (keys::RETRY_PROMPT, "That didn't work. {{prompt}}"),
            (keys::CANCELLED, "Okay, I've cancelled {{flow}}."),
            (
                keys::HELP,
                "Here's what I can do:\n{{#each flows}}- {{this.name}}: {{this.description}}\n{{/each}}",
            ),
            (
                keys::STATUS,
                "Current activity: {{flow}}{{#unless idle}} (waiting on {{pending}}){{/unless}}",
            ),
            (keys::CONFIRM_SWITCH, "Do you want to switch to {{flow}}? (yes/no)"),
            (
                keys::REBOOT_REQUIRES_CONFIRM,
                "This will cancel {{flow}} and start over. Reply 'yes' to confirm.",
            ),
            (
                keys::NETWORK_ERROR,
                "I'm having trouble reaching a service right now. Let's try that again.",
            ),
            (
                keys::FINANCIAL_ABORTED,
                "Something went wrong, so the transaction was aborted. No changes were made.",
            ),
        ];
        for (key, template) in defaults {
            en.insert((*key).to_owned(), (*template).to_owned());
        }
        let mut locales = HashMap::new();
        locales.insert("en".to_owned(), en);
        Self { locales }
    }
}

impl MessageRegistry {
    /// Build a registry from host-provided catalogs, layered over the
    /// built-in English defaults.
    pub fn with_overrides(overrides: HashMap<String, HashMap<String, String>>) -> Self {
        let mut registry = Self::default();
        for (locale, messages) in overrides {
            registry
                .locales
                .entry(locale)
                .or_default()
                .extend(messages);
        }
        registry
    }

    /// Look up a template: `lang` → `"en"` → the key itself.
    pub fn get<'a>(&'a self, lang: &str, key: &'a str) -> &'a str {
        if let Some(template) = self.locales.get(lang).and_then(|m| m.get(key)) {
            return template;
        }
        if let Some(template) = self.locales.get("en").and_then(|m| m.get(key)) {
            return template;
        }
        key
    }

    pub fn has_locale(&self, lang: &str) -> bool {
        self.locales.contains_key(lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_defaults_cover_engine_keys() {
        let registry = MessageRegistry::default();
        for key in [
            keys::WELCOME,
            keys::I_DIDNT_CATCH,
            keys::RETRY_PROMPT,
            keys::CANCELLED,
            keys::HELP,
            keys::STATUS,
            keys::CONFIRM_SWITCH,
            keys::REBOOT_REQUIRES_CONFIRM,
            keys::NETWORK_ERROR,
            keys::FINANCIAL_ABORTED,
        ] {
            assert_ne!(registry.get("en", key), key, "missing default for {key}");
        }
    }

    #[test]
    fn missing_locale_falls_back_to_english() {
        let registry = MessageRegistry::default();
        assert_eq!(
            registry.get("pt", keys::WELCOME),
            registry.get("en", keys::WELCOME)
        );
    }

    #[test]
    fn overrides_layer_on_defaults() {
        let mut pt = HashMap::new();
        pt.insert(keys::WELCOME.to_owned(), "Olá! Como posso ajudar?".to_owned());
        let mut overrides = HashMap::new();
        overrides.insert("pt".to_owned(), pt);

        let registry = MessageRegistry::with_overrides(overrides);
        assert_eq!(registry.get("pt", keys::WELCOME), "Olá! Como posso ajudar?");
        // Keys absent from the override locale still resolve via English.
        assert_eq!(
            registry.get("pt", keys::CANCELLED),
            registry.get("en", keys::CANCELLED)
        );
    }

    #[test]
    fn unknown_key_returns_key() {
        let registry = MessageRegistry::default();
        assert_eq!(registry.get("en", "nope"), "nope");
    }
}
