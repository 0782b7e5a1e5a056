//! Actor tokens listed in `[[actors]]`.

use async_trait::async_trait;

use super::{Actor, ActorAuthenticator, NodeId};
use crate::config::ActorConfig;
use crate::util::constant_time_eq;

pub struct StaticActorAuthenticator {
    actors: Vec<ActorConfig>,
}

impl StaticActorAuthenticator {
    pub fn new(actors: Vec<ActorConfig>) -> Self {
        Self { actors }
    }
}

#[async_trait]
impl ActorAuthenticator for StaticActorAuthenticator {
    async fn authenticate(&self, node_id: NodeId, token_id: &str, secret: &str) -> Option<Actor> {
        let entry = self
            .actors
            .iter()
            .find(|a| a.node_id == node_id && a.token_id == token_id)?;
        constant_time_eq(entry.secret.as_bytes(), secret.as_bytes()).then(|| Actor {
            node_id,
            token_id: token_id.to_string(),
        })
    }
}
