//! User-facing message catalog.
//!
//! Every message the engine itself produces (failure apologies, control
//! command replies, the saved-progress notice) comes from here.  English
//! and Spanish are built in; hosts add locales or override entries.
//! Placeholders use `{name}` syntax.

use std::collections::HashMap;

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Message keys
// ---------------------------------------------------------------------------

pub mod keys {
    // Tool failures
    pub const TOOL_RECOVERABLE: &str = "tool.recoverable";
    pub const TOOL_UNRECOVERABLE: &str = "tool.unrecoverable";
    pub const TOOL_GENERIC: &str = "tool.generic";
    pub const TOOL_RATE_LIMITED: &str = "tool.rate_limited";
    pub const TOOL_AUTH_REQUIRED: &str = "tool.auth_required";

    // Flow control
    pub const FLOW_ERROR: &str = "flow.error";
    pub const FLOW_NO_MATCH: &str = "flow.no_match";
    pub const PROGRESS_SAVED: &str = "flow.progress_saved";

    // Control commands
    pub const CANCELLED: &str = "command.cancelled";
    pub const HELP: &str = "command.help";
    pub const STATUS: &str = "command.status";
}

const EN: &[(&str, &str)] = &[
    (keys::TOOL_RECOVERABLE, "Sorry, that service is not responding right now. Please try again in a moment."),
    (keys::TOOL_UNRECOVERABLE, "Sorry, I couldn't complete that request because some of the details were not valid."),
    (keys::TOOL_GENERIC, "Sorry, something went wrong while handling your request."),
    (keys::TOOL_RATE_LIMITED, "You have made too many requests. Please wait a little before trying again."),
    (keys::TOOL_AUTH_REQUIRED, "You need to be signed in to do that."),
    (keys::FLOW_ERROR, "Sorry, something went wrong. Let's start over."),
    (keys::FLOW_NO_MATCH, "Sorry, I didn't understand that. I can help with: {flows}."),
    (keys::PROGRESS_SAVED, "Let's continue where we left off. Your progress was saved."),
    (keys::CANCELLED, "Okay, I cancelled that."),
    (keys::HELP, "You are in {flow}. Answer the question to continue, or say \"cancel\" to stop. I can also help with: {flows}."),
    (keys::STATUS, "You are in {flow} ({depth} active, {remaining} steps left)."),
];

const ES: &[(&str, &str)] = &[
    (keys::TOOL_RECOVERABLE, "Lo siento, ese servicio no responde en este momento. Inténtalo de nuevo en un momento."),
    (keys::TOOL_UNRECOVERABLE, "Lo siento, no pude completar la solicitud porque algunos datos no son válidos."),
    (keys::TOOL_GENERIC, "Lo siento, algo salió mal al procesar tu solicitud."),
    (keys::TOOL_RATE_LIMITED, "Has hecho demasiadas solicitudes. Espera un poco antes de intentarlo de nuevo."),
    (keys::TOOL_AUTH_REQUIRED, "Necesitas iniciar sesión para hacer eso."),
    (keys::FLOW_ERROR, "Lo siento, algo salió mal. Empecemos de nuevo."),
    (keys::FLOW_NO_MATCH, "Lo siento, no entendí. Puedo ayudarte con: {flows}."),
    (keys::PROGRESS_SAVED, "Sigamos donde lo dejamos. Tu progreso se guardó."),
    (keys::CANCELLED, "De acuerdo, lo cancelé."),
    (keys::HELP, "Estás en {flow}. Responde la pregunta para continuar o di \"cancelar\" para detenerte. También puedo ayudarte con: {flows}."),
    (keys::STATUS, "Estás en {flow} ({depth} activos, {remaining} pasos restantes)."),
];

// ---------------------------------------------------------------------------
// Messages store
// ---------------------------------------------------------------------------

/// Locale-keyed message templates.
#[derive(Debug, Clone)]
pub struct Messages {
    /// locale -> key -> template
    tables: HashMap<String, HashMap<String, String>>,
}

impl Default for Messages {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Messages {
    /// The built-in English and Spanish catalogs.
    pub fn builtin() -> Self {
        let table = |entries: &[(&str, &str)]| {
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>()
        };
        let mut tables = HashMap::new();
        tables.insert("en".to_string(), table(EN));
        tables.insert("es".to_string(), table(ES));
        Self { tables }
    }

    /// Add or replace one template.
    pub fn with(mut self, locale: &str, key: &str, template: impl Into<String>) -> Self {
        self.tables
            .entry(locale.to_string())
            .or_default()
            .insert(key.to_string(), template.into());
        self
    }

    /// Overlay templates from TOML, one table per locale:
    ///
    /// ```toml
    /// [fr]
    /// "flow.error" = "Désolé, une erreur s'est produite."
    /// ```
    pub fn merge_toml_str(mut self, toml_text: &str) -> Result<Self> {
        let overlay: HashMap<String, HashMap<String, String>> =
            toml::from_str(toml_text).map_err(|e| EngineError::Config {
                reason: format!("invalid message catalog: {e}"),
            })?;
        for (locale, entries) in overlay {
            self.tables.entry(locale).or_default().extend(entries);
        }
        Ok(self)
    }

    /// The template for `key` in `locale`.
    ///
    /// Falls back to the language part of the locale, then English, then the
    /// key itself.
    pub fn get(&self, locale: &str, key: &str) -> String {
        let language = locale.split(['-', '_']).next().unwrap_or(locale);
        [locale, language, "en"]
            .iter()
            .find_map(|l| self.tables.get(*l).and_then(|t| t.get(key)))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Get a message with placeholder substitution.
    pub fn get_with(&self, locale: &str, key: &str, vars: &[(&str, &str)]) -> String {
        let mut msg = self.get(locale, key);
        for (name, value) in vars {
            msg = msg.replace(&format!("{{{name}}}"), value);
        }
        msg
    }
}
