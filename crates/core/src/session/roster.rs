use std::time::Instant;

use crate::net::UserId;
use crate::protocol::UserProgress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetUser {
    pub id: UserId,
    pub name: String,
    pub progress: UserProgress,
    /// Sequence number of the last frame received from this user.
    pub ack: i32,
    pub connected_at: Option<Instant>,
}

impl NetUser {
    fn vacant(id: UserId) -> Self {
        Self {
            id,
            name: String::new(),
            progress: UserProgress::Unused,
            ack: 0,
            connected_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.progress != UserProgress::Unused
    }

    pub fn is_logged_in(&self) -> bool {
        self.progress == UserProgress::LoggedIn
    }
}

/// Fixed set of player slots with checked access.
#[derive(Debug, Clone)]
pub struct Roster {
    users: Vec<NetUser>,
}

impl Roster {
    pub fn new(slots: usize) -> Self {
        Self {
            users: (0..slots).map(|id| NetUser::vacant(id as UserId)).collect(),
        }
    }

    pub fn slots(&self) -> usize {
        self.users.len()
    }

    pub fn contains(&self, id: UserId) -> bool {
        (id as usize) < self.users.len()
    }

    pub fn get(&self, id: UserId) -> Option<&NetUser> {
        self.users.get(id as usize)
    }

    pub fn get_mut(&mut self, id: UserId) -> Option<&mut NetUser> {
        self.users.get_mut(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetUser> {
        self.users.iter()
    }

    /// Marks the lowest free slot as connected.
    pub fn claim_free_slot(&mut self) -> Option<UserId> {
        let user = self.users.iter_mut().find(|user| !user.is_active())?;
        user.progress = UserProgress::Connected;
        user.connected_at = Some(Instant::now());
        user.ack = 0;
        Some(user.id)
    }

    pub fn set(&mut self, id: UserId, progress: UserProgress, name: &str) -> bool {
        let Some(user) = self.get_mut(id) else {
            return false;
        };
        if progress == UserProgress::Unused {
            *user = NetUser::vacant(id);
            return true;
        }
        if !user.is_active() {
            user.connected_at = Some(Instant::now());
        }
        user.progress = progress;
        user.name = name.to_string();
        true
    }

    pub fn release(&mut self, id: UserId) {
        if let Some(user) = self.get_mut(id) {
            *user = NetUser::vacant(id);
        }
    }

    pub fn active_ids(&self) -> Vec<UserId> {
        self.users.iter().filter(|u| u.is_active()).map(|u| u.id).collect()
    }

    pub fn logged_in_ids(&self) -> Vec<UserId> {
        self.users.iter().filter(|u| u.is_logged_in()).map(|u| u.id).collect()
    }

    pub fn clear(&mut self) {
        for user in &mut self.users {
            *user = NetUser::vacant(user.id);
        }
    }
}
