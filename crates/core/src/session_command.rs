//! Commands sent to a session actor by the controller and push forwarder.

use dispatchsim_protocol::Session;
use tokio::sync::oneshot;

use crate::transition::{Effect, Input};

pub enum SessionCommand {
    /// Run an input through the transition function.
    /// With a reply channel, the produced effects are sent back after the
    /// actor has executed them.
    Apply {
        input: Input,
        reply: Option<oneshot::Sender<Vec<Effect>>>,
    },

    /// Stop the actor and hand back the final record.
    Shutdown { reply: oneshot::Sender<Session> },
}
