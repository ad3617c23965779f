use super::roster::NetUser;
use crate::net::UserId;

/// Callbacks into the game while the session waits on the network.
///
/// The draw hooks are the only yield points: they must render and return
/// without calling back into the session.
pub trait NetHooks {
    fn draw_frontend(&mut self) {}

    fn draw_gameplay(&mut self) {}

    /// Resync and time sync advance through `total` steps.
    fn resync_progress(&mut self, _step: u32, _total: u32) {}

    fn user_updated(&mut self, _user: &NetUser) {}

    fn pause_changed(&mut self, _paused: bool) {}

    fn chat(&mut self, _player: UserId, _text: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl NetHooks for NoHooks {}
