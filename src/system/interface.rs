use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(libc::gid_t);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(libc::uid_t);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(libc::pid_t);

impl GroupId {
    pub fn new(id: libc::gid_t) -> Self {
        Self(id)
    }

    pub fn get(&self) -> libc::gid_t {
        self.0
    }
}

impl UserId {
    pub const ROOT: Self = Self(0);

    pub fn new(id: libc::uid_t) -> Self {
        Self(id)
    }

    pub fn get(&self) -> libc::uid_t {
        self.0
    }
}

impl ProcessId {
    pub fn new(id: libc::pid_t) -> Self {
        Self(id)
    }

    pub fn get(&self) -> libc::pid_t {
        self.0
    }

    /// Zero and negative ids address process groups or "any child" in the
    /// kill and wait families, so they never name a single process.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::ProcessId;

    #[test]
    fn only_positive_pids_are_valid() {
        assert!(ProcessId::new(1).is_valid());
        assert!(!ProcessId::new(0).is_valid());
        assert!(!ProcessId::new(-1).is_valid());
        assert_eq!(ProcessId::new(42).to_string(), "42");
    }
}
