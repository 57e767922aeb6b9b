//! Connection startup and authentication state machine.

use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ParameterStatus, RawMessage,
    ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
///
/// Drives the startup packet and authentication exchange.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    user: String,
    password: Option<String>,
    startup_params: Vec<(String, String)>,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    pub fn new(options: &Opts) -> Result<Self> {
        if options.ssl_mode == SslMode::Require {
            return Err(Error::Unsupported("sslmode=require: TLS is not available".into()));
        }

        let mut startup_params = vec![
            ("user".to_string(), options.user.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(db) = &options.database {
            startup_params.push(("database".into(), db.clone()));
        }
        if let Some(app) = &options.application_name {
            startup_params.push(("application_name".into(), app.clone()));
        }
        startup_params.extend(options.params.iter().cloned());

        Ok(Self {
            state: ConnectionState::Initial,
            user: options.user.clone(),
            password: options.password.clone(),
            startup_params,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        })
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Take the server parameters reported during startup.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start the connection process by appending the startup packet to `out`.
    pub fn start(&mut self, out: &mut Vec<u8>) -> Action {
        let params: Vec<(&str, &str)> = self
            .startup_params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        write_startup(out, &params);
        self.state = ConnectionState::WaitingAuth;
        Action::Write
    }

    /// Process a message from the server, appending any reply to `out`.
    pub fn step(&mut self, msg: &RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        let result = self.dispatch(msg, out);
        if result.is_err() {
            self.state = ConnectionState::Failed;
        }
        result
    }

    fn dispatch(&mut self, msg: &RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        if RawMessage::is_async_type(msg.type_byte) {
            let async_msg = AsyncMessage::parse(msg)?;
            if let AsyncMessage::ParameterChanged { name, value } = &async_msg {
                self.server_params.push((name.clone(), value.clone()));
            }
            return Ok(Action::HandleAsyncMessageAndReadMessage(async_msg));
        }

        if msg.type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(msg.payload)?;
            return Err(match error.fields.code.as_deref() {
                // invalid_authorization_specification, invalid_password
                Some("28000" | "28P01") => {
                    Error::Auth(error.fields.message.unwrap_or_default())
                }
                _ => error.into_error(),
            });
        }

        match self.state {
            ConnectionState::WaitingAuth => self.handle_auth_message(msg, out),
            ConnectionState::SaslInProgress => self.handle_sasl_message(msg, out),
            ConnectionState::WaitingAuthResult => self.handle_auth_result(msg),
            ConnectionState::WaitingReady => self.handle_ready_message(msg),
            _ => Err(Error::Protocol(format!(
                "Unexpected message in state {:?}",
                self.state
            ))),
        }
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn expect_auth<'m>(msg: &RawMessage<'m>) -> Result<AuthenticationMessage<'m>> {
        if msg.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                msg.type_byte as char
            )));
        }
        AuthenticationMessage::parse(msg.payload)
    }

    fn handle_auth_message(&mut self, msg: &RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        match Self::expect_auth(msg)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(out, self.password()?);
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::Write)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.user, self.password()?, &salt);
                write_password(out, &hashed);
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::Write)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&"SCRAM-SHA-256") {
                    return Err(Error::Auth(format!(
                        "No supported SASL mechanism. Server offers: {mechanisms:?}"
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    "SCRAM-SHA-256",
                    scram.client_first_message().as_bytes(),
                );
                self.scram_client = Some(scram);
                self.state = ConnectionState::SaslInProgress;
                Ok(Action::Write)
            }
            other => Err(Error::Unsupported(format!(
                "Unsupported authentication method: {other:?}"
            ))),
        }
    }

    fn handle_sasl_message(&mut self, msg: &RawMessage<'_>, out: &mut Vec<u8>) -> Result<Action> {
        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match Self::expect_auth(msg)? {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {e}")))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
                Ok(Action::Write)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final)?;
                self.state = ConnectionState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!("Unexpected SASL message: {other:?}"))),
        }
    }

    fn handle_auth_result(&mut self, msg: &RawMessage<'_>) -> Result<Action> {
        match Self::expect_auth(msg)? {
            AuthenticationMessage::Ok => {
                self.state = ConnectionState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("Unexpected auth result: {other:?}"))),
        }
    }

    fn handle_ready_message(&mut self, msg: &RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(msg.payload)?;
                self.backend_key = Some(*key);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                // Sent when the server ignores unrecognized `_pq_.` options; 3.0 is still in use.
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = ConnectionState::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::auth::auth_type;

    fn opts() -> Opts {
        Opts {
            user: "app".into(),
            password: Some("pw".into()),
            database: Some("db".into()),
            ssl_mode: SslMode::Disable,
            ..Opts::default()
        }
    }

    fn auth(kind: i32, extra: &[u8]) -> Vec<u8> {
        let mut payload = kind.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        payload
    }

    #[test]
    fn startup_carries_extra_params() {
        let options = Opts {
            params: vec![("search_path".to_string(), "api".to_string())],
            ..opts()
        };
        let mut sm = ConnectionStateMachine::new(&options).unwrap();
        let mut out = Vec::new();
        assert!(matches!(sm.start(&mut out), Action::Write));
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("user\0app\0"));
        assert!(text.contains("search_path\0api\0"));
    }

    #[test]
    fn md5_then_ready() {
        let mut sm = ConnectionStateMachine::new(&opts()).unwrap();
        let mut out = Vec::new();
        sm.start(&mut out);
        out.clear();

        let payload = auth(auth_type::MD5_PASSWORD, &[1, 2, 3, 4]);
        let action = sm
            .step(&RawMessage::new(msg_type::AUTHENTICATION, &payload), &mut out)
            .unwrap();
        assert!(matches!(action, Action::Write));
        assert_eq!(out[0], b'p');

        let ok = auth(auth_type::OK, &[]);
        sm.step(&RawMessage::new(msg_type::AUTHENTICATION, &ok), &mut out)
            .unwrap();

        let mut key = 7_u32.to_be_bytes().to_vec();
        key.extend_from_slice(&9_u32.to_be_bytes());
        sm.step(&RawMessage::new(msg_type::BACKEND_KEY_DATA, &key), &mut out)
            .unwrap();
        let action = sm
            .step(&RawMessage::new(msg_type::READY_FOR_QUERY, b"I"), &mut out)
            .unwrap();
        assert!(matches!(action, Action::Finished));
        assert_eq!(sm.state(), ConnectionState::Ready);
        assert_eq!(sm.backend_key().map(|k| k.process_id()), Some(7));
    }

    #[test]
    fn missing_password_fails() {
        let mut sm = ConnectionStateMachine::new(
            &Opts {
                password: None,
                ..opts()
            },
        )
        .unwrap();
        let mut out = Vec::new();
        sm.start(&mut out);
        let payload = auth(auth_type::CLEARTEXT_PASSWORD, &[]);
        let err = sm
            .step(&RawMessage::new(msg_type::AUTHENTICATION, &payload), &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(sm.state(), ConnectionState::Failed);
    }

    #[test]
    fn require_ssl_is_unsupported() {
        let result = ConnectionStateMachine::new(
            &Opts {
                ssl_mode: SslMode::Require,
                ..opts()
            },
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
