use std::fmt;

use parking_lot::RwLock;
use rocket::fairing::{self, Fairing, Info, Kind};
use rocket::{Build, Orbit, Rocket};
use serde::Serialize;

/// STARTING -> SERVING -> TERMINATED. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Starting,
    Serving,
    Terminated,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Serving => "serving",
            ServerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: RwLock<ServerState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServerState::Starting),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    /// Move forward to `next`; moving backwards is ignored.
    pub fn advance(&self, next: ServerState) -> bool {
        let mut guard = self.state.write();
        let allowed = matches!(
            (*guard, next),
            (ServerState::Starting, ServerState::Serving)
                | (ServerState::Starting, ServerState::Terminated)
                | (ServerState::Serving, ServerState::Terminated)
        );
        if allowed {
            *guard = next;
        }
        allowed
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Manages [`Lifecycle`] and advances it on liftoff and shutdown.
pub struct LifecycleFairing;

#[rocket::async_trait]
impl Fairing for LifecycleFairing {
    fn info(&self) -> Info {
        Info {
            name: "Lifecycle",
            kind: Kind::Ignite | Kind::Liftoff | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> fairing::Result {
        Ok(rocket.manage(Lifecycle::new()))
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        if let Some(lifecycle) = rocket.state::<Lifecycle>() {
            lifecycle.advance(ServerState::Serving);
        }
        log::info!("serving on port {}", rocket.config().port);
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(lifecycle) = rocket.state::<Lifecycle>() {
            lifecycle.advance(ServerState::Terminated);
        }
        println!("Received shutdown signal, terminating server.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ServerState::Starting);
        assert!(lifecycle.advance(ServerState::Serving));
        assert!(!lifecycle.advance(ServerState::Starting));
        assert!(lifecycle.advance(ServerState::Terminated));
        assert!(!lifecycle.advance(ServerState::Serving));
        assert_eq!(lifecycle.state(), ServerState::Terminated);
        assert_eq!(lifecycle.state().to_string(), "terminated");
    }
}
