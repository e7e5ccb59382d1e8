use std::collections::HashSet;

/// Active session ids seen on a room topic
///
/// Joining twice or leaving an unknown session changes nothing, so repeated
/// presence messages never skew the count.
#[derive(Debug, Default)]
pub struct Presence {
    sessions: HashSet<String>,
}

impl Presence {
    /// Returns whether the set changed
    pub fn join(&mut self, session: &str) -> bool {
        self.sessions.insert(session.to_string())
    }

    /// Returns whether the set changed
    pub fn leave(&mut self, session: &str) -> bool {
        self.sessions.remove(session)
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
