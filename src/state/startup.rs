//! Connection startup and authentication state machine.

use crate::buffer_set::BufferSet;
use crate::config::{Config, SslMode};
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{ScramClient, md5_password};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::Action;
use super::{StateMachine, parse_async_message};

/// Whether a TLS upgrader is wired into this build. `Prefer` falls back
/// to plaintext without one; `Require` still issues the SSLRequest and
/// surfaces the gap to the driver.
const SUPPORTS_TLS: bool = false;

/// Connection startup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    AwaitSslResponse,
    AwaitAuth,
    SaslExchange,
    AwaitAuthOk,
    AwaitReady,
    Finished,
}

/// Startup negotiation and authentication flow.
///
/// Drives SSLRequest, StartupMessage, the authentication exchange
/// (cleartext, MD5, SCRAM-SHA-256) and the parameter/key preamble up to
/// the first ReadyForQuery.
pub struct StartupFlow {
    state: State,
    config: Config,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram: Option<ScramClient>,
    /// SSL response byte, set by the driver after WriteAndReadByte
    ssl_response: u8,
}

impl StartupFlow {
    /// Create a startup flow for the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            state: State::Initial,
            config,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram: None,
            ssl_response: 0,
        }
    }

    /// The backend key data (for cancellation), once received.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.backend_key
    }

    /// Take the server parameters reported during startup.
    pub fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    /// Record the SSL response byte (driver callback after ReadByte).
    pub fn set_ssl_response(&mut self, response: u8) {
        self.ssl_response = response;
    }

    fn auth_failure(message: impl Into<String>) -> Error {
        Error::AuthFailed(ErrorFields {
            severity: Some("FATAL".into()),
            message: Some(message.into()),
            ..Default::default()
        })
    }

    fn password(&self) -> Result<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| Self::auth_failure("password required but not provided"))
    }

    fn handle_initial(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        bufs.write_buffer.clear();

        let send_ssl_request = match self.config.ssl_mode {
            SslMode::Disable => false,
            SslMode::Prefer => SUPPORTS_TLS,
            SslMode::Require => true,
        };

        if send_ssl_request {
            write_ssl_request(&mut bufs.write_buffer);
            self.state = State::AwaitSslResponse;
            Ok(Action::WriteAndReadByte)
        } else {
            self.write_startup_message(&mut bufs.write_buffer);
            self.state = State::AwaitAuth;
            Ok(Action::WriteAndReadMessage)
        }
    }

    fn handle_ssl_response(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        match self.ssl_response {
            b'S' => Ok(Action::TlsHandshake),
            b'N' => {
                if self.config.ssl_mode == SslMode::Require {
                    return Err(Error::InvalidConfig(
                        "SSL required but not supported by server".into(),
                    ));
                }
                bufs.write_buffer.clear();
                self.write_startup_message(&mut bufs.write_buffer);
                self.state = State::AwaitAuth;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSL response: {}",
                other
            ))),
        }
    }

    fn write_startup_message(&self, write_buffer: &mut Vec<u8>) {
        let database = self.config.database.as_deref().unwrap_or(&self.config.user);

        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.config.user),
            ("database", database),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO"),
        ];

        if let Some(app) = &self.config.application_name {
            params.push(("application_name", app));
        }
        if let Some(tz) = &self.config.timezone {
            params.push(("TimeZone", tz));
        }
        for (name, value) in &self.config.params {
            params.push((name, value));
        }

        write_startup(write_buffer, &params);
    }

    fn handle_auth_message(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                bufs.type_byte as char
            )));
        }

        let auth = AuthenticationMessage::parse(&bufs.read_buffer)?;

        match auth {
            AuthenticationMessage::Ok => {
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.password()?.to_string();
                bufs.write_buffer.clear();
                write_password(&mut bufs.write_buffer, &password);
                self.state = State::AwaitAuthOk;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.config.user, self.password()?, &salt);
                bufs.write_buffer.clear();
                write_password(&mut bufs.write_buffer, &hashed);
                self.state = State::AwaitAuthOk;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Sasl { ref mechanisms } => {
                if !mechanisms.contains(&"SCRAM-SHA-256") {
                    return Err(Error::UnsupportedAuth(format!(
                        "no supported SASL mechanism, server offers {:?}",
                        mechanisms
                    )));
                }

                let scram = ScramClient::new(self.password()?);
                let client_first = scram.client_first_message();

                bufs.write_buffer.clear();
                write_sasl_initial_response(
                    &mut bufs.write_buffer,
                    "SCRAM-SHA-256",
                    client_first.as_bytes(),
                );

                self.scram = Some(scram);
                self.state = State::SaslExchange;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Unsupported { .. } => {
                Err(Error::UnsupportedAuth(auth.method_name()))
            }
            AuthenticationMessage::SaslContinue { .. } | AuthenticationMessage::SaslFinal { .. } => {
                Err(Error::Protocol(format!(
                    "unexpected {} outside SASL exchange",
                    auth.method_name()
                )))
            }
        }
    }

    fn handle_sasl_message(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                bufs.type_byte as char
            )));
        }

        let auth = AuthenticationMessage::parse(&bufs.read_buffer)?;

        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_first = simdutf8::compat::from_utf8(data).map_err(|e| {
                    Self::auth_failure(format!("invalid server-first-message: {}", e))
                })?;

                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Self::auth_failure)?;

                bufs.write_buffer.clear();
                write_sasl_response(&mut bufs.write_buffer, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

                let server_final = simdutf8::compat::from_utf8(data).map_err(|e| {
                    Self::auth_failure(format!("invalid server-final-message: {}", e))
                })?;

                scram
                    .verify_server_final(server_final)
                    .map_err(Self::auth_failure)?;

                self.state = State::AwaitAuthOk;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "unexpected {} during SASL exchange",
                other.method_name()
            ))),
        }
    }

    fn handle_auth_ok(&mut self, bufs: &BufferSet) -> Result<Action> {
        if bufs.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected AuthenticationOk, got '{}'",
                bufs.type_byte as char
            )));
        }

        match AuthenticationMessage::parse(&bufs.read_buffer)? {
            AuthenticationMessage::Ok => {
                self.state = State::AwaitReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Self::auth_failure(format!(
                "unexpected auth result: {}",
                other.method_name()
            ))),
        }
    }

    fn handle_ready_message(&mut self, bufs: &BufferSet) -> Result<Action> {
        match bufs.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_key = Some(*BackendKeyData::parse(&bufs.read_buffer)?);
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = crate::protocol::backend::ParameterStatus::parse(&bufs.read_buffer)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(&bufs.read_buffer)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}

impl StateMachine for StartupFlow {
    fn step(&mut self, bufs: &mut BufferSet) -> Result<Action> {
        match self.state {
            State::Initial => return self.handle_initial(bufs),
            State::AwaitSslResponse => return self.handle_ssl_response(bufs),
            _ => {}
        }

        let type_byte = bufs.type_byte;

        // ParameterStatus during AwaitReady is part of normal startup,
        // not an async event.
        if RawMessage::is_async_type(type_byte)
            && !(self.state == State::AwaitReady && type_byte == msg_type::PARAMETER_STATUS)
        {
            return Ok(Action::HandleAsync(parse_async_message(
                type_byte,
                &bufs.read_buffer,
            )?));
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&bufs.read_buffer)?;
            return Err(Error::AuthFailed(error.fields));
        }

        match self.state {
            State::AwaitAuth => self.handle_auth_message(bufs),
            State::SaslExchange => self.handle_sasl_message(bufs),
            State::AwaitAuthOk => self.handle_auth_ok(bufs),
            State::AwaitReady => self.handle_ready_message(bufs),
            state => Err(Error::Protocol(format!("unexpected state {:?}", state))),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
