use sapnotes_core::Error;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    Certificate,
    BrowserUnavailable,
    AuthTimeout,
    SessionExpired,
    AuthenticationFailed,
    TokenExtraction,
    Timeout,
    InvalidParams,
    SearchFailed,
    FetchFailed,
    CredentialStore,
    NotConfigured,
}

impl ErrorCode {
    pub(crate) fn from_error(e: &Error) -> Self {
        match e {
            Error::Certificate(_) => Self::Certificate,
            Error::BrowserUnavailable(_) => Self::BrowserUnavailable,
            Error::AuthTimeout(_) => Self::AuthTimeout,
            Error::SessionExpired(_) => Self::SessionExpired,
            Error::AuthenticationFailed(_) => Self::AuthenticationFailed,
            Error::TokenExtraction(_) => Self::TokenExtraction,
            Error::Timeout(_) => Self::Timeout,
            Error::InvalidParams(_) => Self::InvalidParams,
            Error::Search(_) => Self::SearchFailed,
            Error::Fetch(_) => Self::FetchFailed,
            Error::Store(_) => Self::CredentialStore,
            Error::NotConfigured(_) => Self::NotConfigured,
        }
    }

    /// The taxonomy name; identical to `Error::kind`.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Certificate => "CertificateError",
            Self::BrowserUnavailable => "BrowserUnavailableError",
            Self::AuthTimeout => "AuthTimeoutError",
            Self::SessionExpired => "SessionExpiredError",
            Self::AuthenticationFailed => "AuthenticationFailedError",
            Self::TokenExtraction => "TokenExtractionError",
            Self::Timeout => "TimeoutError",
            Self::InvalidParams => "InvalidParamsError",
            Self::SearchFailed => "SearchError",
            Self::FetchFailed => "FetchError",
            Self::CredentialStore => "CredentialStoreError",
            Self::NotConfigured => "NotConfiguredError",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::AuthTimeout
            | Self::AuthenticationFailed
            | Self::SessionExpired
            | Self::TokenExtraction
            | Self::Timeout
            | Self::SearchFailed
            | Self::FetchFailed => true,
            Self::Certificate
            | Self::BrowserUnavailable
            | Self::InvalidParams
            | Self::CredentialStore
            | Self::NotConfigured => false,
        }
    }

    pub(crate) fn hint(self) -> &'static str {
        match self {
            Self::Certificate => {
                "Set SAPNOTES_PFX_PATH to a readable, non-empty .pfx client certificate (and SAPNOTES_PFX_PASSPHRASE if it has one)."
            }
            Self::BrowserUnavailable => {
                "Install Node.js and Playwright (`npm i -g playwright && npx playwright install chromium`), or set SAPNOTES_NODE / SAPNOTES_NODE_PATH. Run `sapnotes doctor`."
            }
            Self::AuthTimeout => {
                "A navigation step exceeded its deadline. Retry, or raise SAPNOTES_NAV_TIMEOUT_MS."
            }
            Self::SessionExpired => {
                "The vendor rejected the session even after one re-authentication. Retry later or run `sapnotes login`."
            }
            Self::AuthenticationFailed => {
                "Certificate login did not reach the portal. Check the certificate is enrolled for this user; set SAPNOTES_HEADFUL=true to watch the login."
            }
            Self::TokenExtraction => {
                "No search token was issued for this session. Retry; if it persists the portal's search page may have changed (SAPNOTES_TOKEN_SEARCH_URL / SAPNOTES_TOKEN_HOST)."
            }
            Self::Timeout => {
                "A vendor request exceeded its deadline. Retry, or raise SAPNOTES_HTTP_TIMEOUT_MS."
            }
            Self::InvalidParams => "Fix the request parameters and retry.",
            Self::SearchFailed => "The search API failed. Retry later.",
            Self::FetchFailed => "The detail request failed. Retry later.",
            Self::CredentialStore => {
                "The credential file could not be read or written. Check SAPNOTES_TOKEN_CACHE and its directory permissions."
            }
            Self::NotConfigured => "Required configuration is missing. Run `sapnotes doctor`.",
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(super::SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
    if payload.get("attempts").is_none() {
        payload["attempts"] = serde_json::Value::Null;
    }
    if payload.get("request").is_none() {
        payload["request"] = serde_json::Value::Null;
    }
}

pub(crate) fn error_obj(code: ErrorCode, message: impl ToString) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: &'static str,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: code.hint(),
        retryable: code.retryable(),
    };
    serde_json::to_value(e).unwrap_or_else(|_| {
        serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": code.hint(),
            "retryable": code.retryable()
        })
    })
}

pub(crate) fn error_from(e: &Error) -> serde_json::Value {
    error_obj(ErrorCode::from_error(e), e)
}
