//! Login response validation.
//!
//! After a Login7 request the server answers with a fixed token sequence:
//!
//! ```text
//! ENVCHANGE (database)  INFO  LOGINACK  ENVCHANGE (packet size)  DONE
//! ```
//!
//! [`LoginSequence`] is fed those tokens one at a time and rejects anything
//! out of order. An ERROR in place of the LOGINACK is a login failure.

use crate::error::ProtocolError;
use crate::token::{LoginAck, Token, TokenType};

/// Step the validator expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    FirstEnvChange,
    Info,
    LoginAck,
    SecondEnvChange,
    Done,
    Finished,
}

impl Step {
    const fn expected(self) -> &'static str {
        match self {
            Self::FirstEnvChange | Self::SecondEnvChange => "ENVCHANGE",
            Self::Info => "INFO",
            Self::LoginAck => "LOGINACK",
            Self::Done => "DONE",
            Self::Finished => "end of login response",
        }
    }
}

/// Negotiated session values recorded from a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Current database, if the server reported one.
    pub database: Option<String>,
    /// Negotiated packet size, if the server reported one.
    pub packet_size: Option<usize>,
    /// The server's acknowledgment.
    pub login_ack: LoginAck,
}

/// Validates the login response token sequence.
#[derive(Debug, Clone)]
pub struct LoginSequence {
    step: Step,
    database: Option<String>,
    packet_size: Option<usize>,
    login_ack: Option<LoginAck>,
}

impl Default for LoginSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginSequence {
    /// Create a validator at the start of the sequence.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            step: Step::FirstEnvChange,
            database: None,
            packet_size: None,
            login_ack: None,
        }
    }

    /// Whether the terminating DONE has been accepted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.step == Step::Finished
    }

    /// Feed the next token.
    ///
    /// Returns the outcome once the terminating DONE is accepted, `None`
    /// while more tokens are required.
    pub fn accept(&mut self, token: Token) -> Result<Option<LoginOutcome>, ProtocolError> {
        match (self.step, token) {
            (Step::FirstEnvChange | Step::SecondEnvChange, Token::EnvChange(env)) => {
                if let Some(db) = env.new_database() {
                    self.database = Some(db.to_owned());
                }
                if let Some(size) = env.new_packet_size() {
                    self.packet_size = Some(size);
                }
                self.step = if self.step == Step::FirstEnvChange {
                    Step::Info
                } else {
                    Step::Done
                };
                Ok(None)
            }
            (Step::Info, Token::Info(_)) => {
                self.step = Step::LoginAck;
                Ok(None)
            }
            (Step::LoginAck, Token::LoginAck(ack)) => {
                self.login_ack = Some(ack);
                self.step = Step::SecondEnvChange;
                Ok(None)
            }
            (_, Token::Error(err)) if self.step != Step::Finished => {
                Err(ProtocolError::LoginFailed {
                    number: err.number,
                    message: err.message,
                })
            }
            (Step::Done, Token::Done(done)) => {
                if done.has_error() {
                    return Err(ProtocolError::LoginFailed {
                        number: 0,
                        message: "server reported an error completing the login".into(),
                    });
                }
                self.step = Step::Finished;
                let login_ack = self.login_ack.take().ok_or(ProtocolError::Malformed(
                    "login response without LOGINACK",
                ))?;
                Ok(Some(LoginOutcome {
                    database: self.database.take(),
                    packet_size: self.packet_size,
                    login_ack,
                }))
            }
            (step, token) => Err(ProtocolError::UnexpectedToken {
                expected: step.expected(),
                actual: token.token_type(),
            }),
        }
    }

    /// The token type expected next, if any.
    #[must_use]
    pub fn expected(&self) -> Option<TokenType> {
        match self.step {
            Step::FirstEnvChange | Step::SecondEnvChange => Some(TokenType::EnvChange),
            Step::Info => Some(TokenType::Info),
            Step::LoginAck => Some(TokenType::LoginAck),
            Step::Done => Some(TokenType::Done),
            Step::Finished => None,
        }
    }
}
