//! Demonstration services run by the `meshwire` binary.
//!
//! - echo: write every received byte back
//! - silent: swallow requests without answering
//! - responder: answer each framed [`SimpleData`] request
//! - fanout: forward each request to two upstreams and report the outcome

mod echo;
mod fanout;
mod responder;

pub use echo::echo;
pub use fanout::fanout;
pub use responder::{responder, silent};

use crate::config::{Config, Role};
use crate::error::{Error, Result};
use crate::runtime::{json_payload, Buffer, Message, MessageRegistry};
use crate::server::Server;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

/// Demo request/response payload, carried as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleData {
    pub id: u32,
    pub msg: String,
}

impl SimpleData {
    pub const TYPE_NAME: &'static str = "request.simpledata";

    pub fn new(id: u32, msg: impl Into<String>) -> Self {
        Self {
            id,
            msg: msg.into(),
        }
    }
}

impl Message for SimpleData {
    fn type_name(&self) -> &str {
        Self::TYPE_NAME
    }

    fn encode_payload(&self, out: &mut Buffer) {
        json_payload(self, out);
    }
}

/// Register the demo message types.
pub fn register_messages(messages: &mut MessageRegistry) {
    messages.register_json::<SimpleData>(SimpleData::TYPE_NAME);
}

/// Install the handlers for `config.role` on `server`.
pub fn install(server: &mut Server, config: &Config) -> Result<()> {
    register_messages(server.messages_mut());

    match config.role {
        Role::Echo => {
            server.on_receive(echo);
        }
        Role::Silent => {
            server.on_receive(silent);
        }
        Role::Responder => {
            server.on_receive(responder(format!("responder {}", server.local_addr())));
        }
        Role::Fanout => {
            let upstreams = parse_upstreams(&config.upstreams)?;
            let &[first, second, ..] = upstreams.as_slice() else {
                return Err(Error::MissingUpstreams {
                    service: "fanout",
                    needed: 2,
                    found: upstreams.len(),
                });
            };
            info!(%first, %second, "Fanning out to upstreams");
            server.on_receive(fanout(first, second, config.fanout_timeout()));
        }
    }

    info!(role = ?config.role, "Service installed");
    Ok(())
}

fn parse_upstreams(upstreams: &[String]) -> Result<Vec<SocketAddr>> {
    upstreams
        .iter()
        .map(|u| u.parse().map_err(|_| Error::InvalidAddress(u.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstreams() {
        let parsed = parse_upstreams(&["127.0.0.1:1".into(), "[::1]:2".into()]).unwrap();
        assert_eq!(parsed[0].port(), 1);
        assert!(parsed[1].is_ipv6());

        assert!(matches!(
            parse_upstreams(&["localhost:80".into()]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_fanout_requires_two_upstreams() {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            role: Role::Fanout,
            upstreams: vec!["127.0.0.1:1".to_string()],
            ..Config::default()
        };
        let mut server = Server::bind(config.clone()).unwrap();
        assert!(matches!(
            install(&mut server, &config),
            Err(Error::MissingUpstreams { found: 1, .. })
        ));
    }
}
