use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

/// Users with a pass currently running in this process
pub struct InFlightUsers {
    users: Mutex<HashSet<Uuid>>,
}

/// Removes the user from the in-flight set when dropped
pub struct InFlightGuard<'a> {
    owner: &'a InFlightUsers,
    user_id: Uuid,
}

impl InFlightUsers {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashSet::new()),
        }
    }

    /// `None` when a pass for `user_id` is already in flight
    pub fn try_enter(&self, user_id: Uuid) -> Option<InFlightGuard<'_>> {
        if self.users.lock().insert(user_id) {
            Some(InFlightGuard {
                owner: self,
                user_id,
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }
}

impl Default for InFlightUsers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.users.lock().remove(&self.user_id);
    }
}
