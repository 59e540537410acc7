//! Namespace capability set resolved once per launch

use nix::sched::CloneFlags;
use nodepm_core::ContainerArgs;

/// Namespace types a launched process can be isolated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Pid,
    Mount,
    Uts,
    Net,
}

impl Namespace {
    fn clone_flag(self) -> CloneFlags {
        match self {
            Namespace::Pid => CloneFlags::CLONE_NEWPID,
            Namespace::Mount => CloneFlags::CLONE_NEWNS,
            Namespace::Uts => CloneFlags::CLONE_NEWUTS,
            Namespace::Net => CloneFlags::CLONE_NEWNET,
        }
    }
}

/// The namespaces a child gets created in. Empty means the host namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    namespaces: Vec<Namespace>,
}

impl NamespaceSet {
    /// No isolation at all
    pub fn host() -> Self {
        Self::default()
    }

    /// Pid, mount and uts namespaces always; network unless the container
    /// asked to share the host network.
    pub fn for_container(args: &ContainerArgs) -> Self {
        let mut set = Self::host()
            .with(Namespace::Pid)
            .with(Namespace::Mount)
            .with(Namespace::Uts);
        if !args.host_network {
            set = set.with(Namespace::Net);
        }
        set
    }

    pub fn with(mut self, namespace: Namespace) -> Self {
        if !self.contains(namespace) {
            self.namespaces.push(namespace);
        }
        self
    }

    pub fn contains(&self, namespace: Namespace) -> bool {
        self.namespaces.contains(&namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Namespace> + '_ {
        self.namespaces.iter().copied()
    }

    pub fn to_clone_flags(&self) -> CloneFlags {
        self.iter()
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.clone_flag())
    }
}
