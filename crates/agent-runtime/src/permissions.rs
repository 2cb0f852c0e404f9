use std::collections::HashSet;

/// Host capabilities an agent module may declare.
///
/// Each host import belongs to exactly one capability; a module may only
/// import, and only call, functions whose capability it declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Capability {
    /// Current Data Buffer, task and member regions.
    ReadRoomData,
    /// Pending event payload and room context.
    ReadEvent,
    /// The instance's own persisted-state slot.
    State,
    EmitAssignment,
    EmitEvent,
    Clock,
    Log,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::ReadRoomData,
        Capability::ReadEvent,
        Capability::State,
        Capability::EmitAssignment,
        Capability::EmitEvent,
        Capability::Clock,
        Capability::Log,
    ];

    /// Capability guarding a host import, or `None` if the name is not part
    /// of the gateway.
    pub fn for_import(name: &str) -> Option<Capability> {
        match name {
            "host_get_assignment_data" | "host_get_tasks" | "host_get_members" => {
                Some(Capability::ReadRoomData)
            }
            "host_get_event" | "host_get_context" => Some(Capability::ReadEvent),
            "host_get_state" | "host_set_state" => Some(Capability::State),
            "host_emit_assignment" => Some(Capability::EmitAssignment),
            "host_emit_event" => Some(Capability::EmitEvent),
            "host_get_now" => Some(Capability::Clock),
            "host_log" => Some(Capability::Log),
            _ => None,
        }
    }
}

/// A set of capabilities granted to an agent instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PermissionSet {
    capabilities: HashSet<Capability>,
}

impl PermissionSet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: caps.into_iter().collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(Capability::ALL)
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Capabilities present in `self` but not in `ceiling`.
    pub fn exceeding(&self, ceiling: &PermissionSet) -> Vec<Capability> {
        let mut extra: Vec<_> = self
            .capabilities
            .difference(&ceiling.capabilities)
            .copied()
            .collect();
        extra.sort_by_key(|c| Capability::ALL.iter().position(|a| a == c));
        extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_import_maps_to_a_capability() {
        for name in [
            "host_get_assignment_data",
            "host_emit_assignment",
            "host_get_state",
            "host_set_state",
            "host_get_event",
            "host_get_context",
            "host_get_tasks",
            "host_get_members",
            "host_emit_event",
            "host_get_now",
            "host_log",
        ] {
            assert!(Capability::for_import(name).is_some(), "{name}");
        }
        assert_eq!(Capability::for_import("fd_write"), None);
    }

    #[test]
    fn test_has() {
        let perms = PermissionSet::new([Capability::ReadRoomData, Capability::EmitAssignment]);
        assert!(perms.has(Capability::ReadRoomData));
        assert!(!perms.has(Capability::State));
        assert!(PermissionSet::all().has(Capability::Log));
    }

    #[test]
    fn test_exceeding() {
        let declared = PermissionSet::new([Capability::Log, Capability::State, Capability::Clock]);
        let ceiling = PermissionSet::new([Capability::Log]);
        assert_eq!(
            declared.exceeding(&ceiling),
            vec![Capability::State, Capability::Clock]
        );
        assert!(declared.exceeding(&PermissionSet::all()).is_empty());
    }
}
