use {
    derive_more::{Display, Error},
    wasm_bindgen::{JsCast, JsValue},
};

/// Error thrown by a browser API.
#[derive(Debug, Clone, Display, Error)]
#[display("{message}")]
pub struct JsError {
    /// Message of the thrown value, or its debug form if it carries none.
    pub message: String,
}

impl JsError {
    /// Wraps a message reported by the browser.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<JsValue> for JsError {
    fn from(value: JsValue) -> Self {
        let message = match value.dyn_ref::<js_sys::Error>() {
            Some(err) => String::from(err.message()),
            None => value.as_string().unwrap_or_else(|| format!("{value:?}")),
        };
        Self { message }
    }
}
