//! Key layout for the shared state store.
//!
//! Every key can be namespaced by an org prefix (`REDIS_PREFIX`) so multiple
//! tenants can share one Redis.

/// Key builder carrying the resolved prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(org_prefix: Option<&str>) -> Self {
        let prefix = match org_prefix {
            Some(p) if !p.is_empty() => format!("{p}:sio:"),
            _ => "sio:".to_string(),
        };
        Self { prefix }
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}session:{session_id}", self.prefix)
    }

    pub fn runner(&self, runner_id: &str) -> String {
        format!("{}runner:{runner_id}", self.prefix)
    }

    pub fn terminal(&self, terminal_id: &str) -> String {
        format!("{}terminal:{terminal_id}", self.prefix)
    }

    pub fn seq(&self, session_id: &str) -> String {
        format!("{}seq:{session_id}", self.prefix)
    }

    pub fn runner_link(&self, session_id: &str) -> String {
        format!("{}runner-link:{session_id}", self.prefix)
    }

    pub fn all_sessions(&self) -> String {
        format!("{}all-sessions", self.prefix)
    }

    pub fn user_sessions(&self, user_id: &str) -> String {
        format!("{}user-sessions:{user_id}", self.prefix)
    }

    pub fn all_runners(&self) -> String {
        format!("{}all-runners", self.prefix)
    }

    pub fn user_runners(&self, user_id: &str) -> String {
        format!("{}user-runners:{user_id}", self.prefix)
    }

    pub fn runner_terminals(&self, runner_id: &str) -> String {
        format!("{}runner-terminals:{runner_id}", self.prefix)
    }

    pub fn events(&self, session_id: &str) -> String {
        format!("{}events:{session_id}", self.prefix)
    }

    pub fn bus_channel(&self) -> String {
        format!("{}bus", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprefixed_layout() {
        let keys = Keys::new(None);
        assert_eq!(keys.session("s1"), "sio:session:s1");
        assert_eq!(keys.seq("s1"), "sio:seq:s1");
        assert_eq!(keys.all_sessions(), "sio:all-sessions");
        assert_eq!(keys.user_runners("u1"), "sio:user-runners:u1");
    }

    #[test]
    fn org_prefix_applies_to_every_key() {
        let keys = Keys::new(Some("acme"));
        assert_eq!(keys.session("s1"), "acme:sio:session:s1");
        assert_eq!(keys.bus_channel(), "acme:sio:bus");
    }

    #[test]
    fn empty_prefix_is_ignored() {
        let keys = Keys::new(Some(""));
        assert_eq!(keys.all_runners(), "sio:all-runners");
    }
}
