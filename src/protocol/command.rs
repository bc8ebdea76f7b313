//! Mi IO commands: the method catalogue and the queued request/response pair.

use serde_json::{Value, json};

use super::{CommandError, Result};

/// Methods with a well-known meaning across device families.
///
/// Any other method name is still sent verbatim and reported as
/// [`Method::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Device information (model, firmware, network)
    Info,
    /// Wi-Fi association state
    WifiAssocState,
    /// Router configuration
    ConfigRouter,
    /// Read properties
    GetProp,
    /// Read a single value
    GetValue,
    /// Set operating mode
    SetMode,
    /// Switch power
    SetPower,
    /// Set brightness
    SetBright,
    /// Method outside the catalogue
    Unknown,
}

impl Method {
    const ALL: [Self; 8] = [
        Self::Info,
        Self::WifiAssocState,
        Self::ConfigRouter,
        Self::GetProp,
        Self::GetValue,
        Self::SetMode,
        Self::SetPower,
        Self::SetBright,
    ];

    /// Wire name of the method
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "miIO.info",
            Self::WifiAssocState => "miIO.wifi_assoc_state",
            Self::ConfigRouter => "miIO.config_router",
            Self::GetProp => "get_prop",
            Self::GetValue => "get_value",
            Self::SetMode => "set_mode",
            Self::SetPower => "set_power",
            Self::SetBright => "set_bright",
            Self::Unknown => "",
        }
    }

    /// Look up a method by wire name
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == name)
            .unwrap_or(Self::Unknown)
    }
}

/// Split `"method[params]"` or `"method{params}"` into a method name and a
/// JSON params document. Without a params part the params default to `[]`.
pub fn parse_command_line(line: &str) -> Result<(String, Value)> {
    let line = line.trim();
    let split = line
        .find('[')
        .filter(|&idx| idx > 0)
        .or_else(|| line.find('{').filter(|&idx| idx > 0));

    match split {
        Some(idx) => {
            let params = serde_json::from_str(line[idx..].trim())?;
            Ok((line[..idx].trim().to_owned(), params))
        }
        None => Ok((line.to_owned(), json!([]))),
    }
}

/// One request travelling through the session queue.
///
/// The outcome is set exactly once by the dispatch worker; listeners receive
/// the command after that.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    id: u32,
    method: String,
    params: Value,
    known: Method,
    outcome: Option<std::result::Result<Value, CommandError>>,
}

impl PendingCommand {
    pub(crate) fn new(id: u32, method: impl Into<String>, params: Value) -> Self {
        let method = method.into();
        let known = Method::from_name(&method);
        Self {
            id,
            method,
            params,
            known,
            outcome: None,
        }
    }

    /// Command id as sent in the JSON-RPC envelope
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Method name
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Catalogue entry for the method
    #[must_use]
    pub const fn known_method(&self) -> Method {
        self.known
    }

    /// Params document
    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// JSON-RPC envelope: `{"id": .., "method": .., "params": ..}`.
    #[must_use]
    pub fn to_request(&self) -> Value {
        json!({
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }

    /// Record the outcome. Returns `false` if one was already recorded.
    pub(crate) fn resolve(&mut self, outcome: std::result::Result<Value, CommandError>) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Whether the exchange has completed
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Raw outcome, `None` until the exchange completes
    #[must_use]
    pub fn outcome(&self) -> Option<&std::result::Result<Value, CommandError>> {
        self.outcome.as_ref()
    }

    /// Decoded device reply
    #[must_use]
    pub fn response(&self) -> Option<&Value> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().ok())
    }

    /// Exchange failure, if any
    #[must_use]
    pub fn error(&self) -> Option<&CommandError> {
        self.outcome
            .as_ref()
            .and_then(|outcome| outcome.as_ref().err())
    }

    /// `"result"` member of the device reply
    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        self.response().and_then(|response| response.get("result"))
    }

    /// True when unresolved, failed, or the device answered with an `"error"` member.
    #[must_use]
    pub fn is_error(&self) -> bool {
        match &self.outcome {
            Some(Ok(response)) => response.get("error").is_some(),
            _ => true,
        }
    }

    /// Reply as a JSON object, with failures folded into `{"error": ..}`.
    #[must_use]
    pub fn response_json(&self) -> Value {
        match &self.outcome {
            Some(Ok(response)) => response.clone(),
            Some(Err(err)) => json!({ "error": err.to_string() }),
            None => json!({ "error": "pending" }),
        }
    }
}
