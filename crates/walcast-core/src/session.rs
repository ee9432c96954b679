//! Per-connection control state machine.
//!
//! A [`Session`] starts unauthenticated with no table filter and changes only
//! in response to messages from its own connection.

use std::collections::BTreeSet;

use crate::protocol::{ClientMessage, ErrorCode, InfoCode, ServerMessage};

/// Shared-secret policy for client connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    secret: Option<String>,
}

impl AuthPolicy {
    /// Blank secrets are treated as "no secret configured".
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn open() -> Self {
        Self::default()
    }

    pub fn requires_auth(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, token: Option<&str>) -> bool {
        match (&self.secret, token) {
            (None, _) => true,
            (Some(secret), Some(token)) => secret == token,
            (Some(_), None) => false,
        }
    }
}

/// What the connection should do after a message has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Send(ServerMessage),
    /// Send the message, then close the socket.
    SendAndClose(ServerMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    authenticated: bool,
    /// `None` receives every table; an explicit set only those tables.
    subscription: Option<BTreeSet<String>>,
}

impl Session {
    /// Open a session for a freshly accepted socket.
    ///
    /// `query_token` is the credential supplied during connection
    /// establishment, if any. Returns the greeting to send, if any.
    pub fn accept(policy: &AuthPolicy, query_token: Option<&str>) -> (Self, Option<ServerMessage>) {
        if !policy.requires_auth() {
            let session = Session {
                authenticated: true,
                subscription: None,
            };
            return (session, None);
        }

        if query_token.is_some() && policy.verify(query_token) {
            let session = Session {
                authenticated: true,
                subscription: None,
            };
            return (session, Some(ServerMessage::info(InfoCode::AuthenticatedViaQuery)));
        }

        (
            Session::default(),
            Some(ServerMessage::info(InfoCode::PleaseAuth)),
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn subscription(&self) -> Option<&BTreeSet<String>> {
        self.subscription.as_ref()
    }

    /// Whether a change to `table` should be delivered to this connection.
    pub fn wants(&self, table: Option<&str>) -> bool {
        if !self.authenticated {
            return false;
        }
        match (&self.subscription, table) {
            (None, _) => true,
            (Some(tables), Some(table)) => tables.contains(table),
            (Some(_), None) => false,
        }
    }

    /// Apply one raw client frame and produce the reply.
    pub fn handle(&mut self, policy: &AuthPolicy, text: &str) -> Reply {
        let Ok(message) = ClientMessage::parse(text) else {
            return Reply::Send(ServerMessage::error(ErrorCode::InvalidJson));
        };

        if let ClientMessage::Auth { token } = &message {
            return self.authenticate(policy, token.as_deref());
        }

        if policy.requires_auth() && !self.authenticated {
            return Reply::Send(ServerMessage::error(ErrorCode::NotAuthenticated));
        }

        let reply = match message {
            ClientMessage::Subscribe { tables: Some(tables) } => {
                let tables: BTreeSet<String> = tables.into_iter().collect();
                let echoed = tables.iter().cloned().collect();
                self.subscription = Some(tables);
                ServerMessage::Subscribed { tables: echoed }
            }
            ClientMessage::Unsubscribe { tables: Some(tables) } => {
                let subscription = self.subscription.get_or_insert_with(BTreeSet::new);
                for table in &tables {
                    subscription.remove(table);
                }
                ServerMessage::Unsubscribed {
                    tables: subscription.iter().cloned().collect(),
                }
            }
            ClientMessage::Subscribe { tables: None } | ClientMessage::Unsubscribe { tables: None } => {
                ServerMessage::error(ErrorCode::TablesMustBeArray)
            }
            ClientMessage::Unknown { .. } | ClientMessage::Auth { .. } => {
                ServerMessage::error(ErrorCode::UnknownMessageType)
            }
        };

        Reply::Send(reply)
    }

    fn authenticate(&mut self, policy: &AuthPolicy, token: Option<&str>) -> Reply {
        if !policy.requires_auth() {
            self.authenticated = true;
            return Reply::Send(ServerMessage::info(InfoCode::NoAuthRequired));
        }

        if policy.verify(token) {
            self.authenticated = true;
            Reply::Send(ServerMessage::info(InfoCode::Authenticated))
        } else {
            Reply::SendAndClose(ServerMessage::error(ErrorCode::InvalidToken))
        }
    }
}
