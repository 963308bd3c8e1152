//! Breakout groups: temporary subdivision of a session's membership.
//!
//! A member belongs to at most one active group. Group management requires
//! `can_manage_members`, except joining or leaving on one's own behalf.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use labsync_core::{
    Capability, CollabError, GroupId, Permissions, SessionId, Timestamp, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakoutGroup {
    pub id: GroupId,
    pub session_id: SessionId,
    pub name: String,
    /// Members in assignment order.
    pub members: Vec<UserId>,
    pub active: bool,
    pub created_at: Timestamp,
}

impl BreakoutGroup {
    pub fn contains(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Group sizes for `n` members in groups of at most `group_size`, balanced
/// so no trailing group is undersized: larger groups first.
pub fn balanced_sizes(n: usize, group_size: usize) -> Vec<usize> {
    if n == 0 || group_size == 0 {
        return Vec::new();
    }
    let groups = n.div_ceil(group_size);
    let base = n / groups;
    let extra = n % groups;
    (0..groups).map(|i| base + usize::from(i < extra)).collect()
}

/// Active breakout groups of one session.
pub struct BreakoutCoordinator {
    session_id: SessionId,
    groups: Vec<BreakoutGroup>,
    membership: HashMap<UserId, GroupId>,
}

impl BreakoutCoordinator {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id, groups: Vec::new(), membership: HashMap::new() }
    }

    fn require_manage(caller: UserId, perms: &Permissions) -> Result<(), CollabError> {
        perms.require(caller, Capability::ManageMembers)
    }

    /// Acting on someone else needs `can_manage_members`.
    fn require_self_or_manage(
        caller: UserId,
        perms: &Permissions,
        target: UserId,
    ) -> Result<(), CollabError> {
        if caller == target {
            Ok(())
        } else {
            Self::require_manage(caller, perms)
        }
    }

    fn group_mut(&mut self, group_id: &GroupId) -> Result<&mut BreakoutGroup, CollabError> {
        self.groups
            .iter_mut()
            .find(|g| g.id == *group_id)
            .ok_or(CollabError::GroupNotFound(*group_id))
    }

    /// Detach `user` from its current group, if any.
    fn detach(&mut self, user: &UserId) -> Option<GroupId> {
        let group_id = self.membership.remove(user)?;
        if let Some(group) = self.groups.iter_mut().find(|g| g.id == group_id) {
            group.members.retain(|m| m != user);
        }
        Some(group_id)
    }

    fn attach(&mut self, user: UserId, group_id: GroupId) -> Result<(), CollabError> {
        // Validate before detaching so a bad id leaves membership intact.
        self.group_mut(&group_id)?;
        if self.membership.get(&user) == Some(&group_id) {
            return Ok(());
        }
        self.detach(&user);
        self.group_mut(&group_id)?.members.push(user);
        self.membership.insert(user, group_id);
        Ok(())
    }

    pub fn create_group(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        name: impl Into<String>,
        members: &[UserId],
        now: Timestamp,
    ) -> Result<BreakoutGroup, CollabError> {
        Self::require_manage(caller, perms)?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CollabError::InvalidConfig("group name must not be empty".into()));
        }
        let group = BreakoutGroup {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            name,
            members: Vec::new(),
            active: true,
            created_at: now,
        };
        let group_id = group.id;
        self.groups.push(group);
        for user in members {
            self.attach(*user, group_id)?;
        }
        log::info!("Breakout group {group_id} created in session {}", self.session_id);
        Ok(self.group_mut(&group_id)?.clone())
    }

    pub fn join_group(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        target: UserId,
        group_id: GroupId,
    ) -> Result<(), CollabError> {
        Self::require_self_or_manage(caller, perms, target)?;
        self.attach(target, group_id)
    }

    /// Returns the group the target left, or `None` if it was in none.
    pub fn leave_group(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        target: UserId,
    ) -> Result<Option<GroupId>, CollabError> {
        Self::require_self_or_manage(caller, perms, target)?;
        Ok(self.detach(&target))
    }

    pub fn move_user_to_group(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        target: UserId,
        group_id: GroupId,
    ) -> Result<(), CollabError> {
        Self::require_manage(caller, perms)?;
        self.attach(target, group_id)
    }

    pub fn close_group(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        group_id: GroupId,
    ) -> Result<BreakoutGroup, CollabError> {
        Self::require_manage(caller, perms)?;
        let idx = self
            .groups
            .iter()
            .position(|g| g.id == group_id)
            .ok_or(CollabError::GroupNotFound(group_id))?;
        let mut group = self.groups.remove(idx);
        for user in &group.members {
            self.membership.remove(user);
        }
        group.active = false;
        Ok(group)
    }

    pub fn close_all_groups(
        &mut self,
        caller: UserId,
        perms: &Permissions,
    ) -> Result<usize, CollabError> {
        Self::require_manage(caller, perms)?;
        let closed = self.groups.len();
        self.groups.clear();
        self.membership.clear();
        Ok(closed)
    }

    /// Partition `online` (in join order) into balanced groups of at most
    /// `group_size`, replacing every existing group.
    pub fn auto_assign(
        &mut self,
        caller: UserId,
        perms: &Permissions,
        group_size: usize,
        online: &[UserId],
        now: Timestamp,
    ) -> Result<Vec<BreakoutGroup>, CollabError> {
        Self::require_manage(caller, perms)?;
        if group_size == 0 {
            return Err(CollabError::InvalidConfig("group_size must be >= 1".into()));
        }
        if group_size > online.len() {
            return Err(CollabError::InsufficientMembers {
                requested: group_size,
                available: online.len(),
            });
        }

        self.groups.clear();
        self.membership.clear();

        let mut remaining = online.iter().copied();
        for (i, size) in balanced_sizes(online.len(), group_size).into_iter().enumerate() {
            let members: Vec<UserId> = remaining.by_ref().take(size).collect();
            let group = BreakoutGroup {
                id: Uuid::new_v4(),
                session_id: self.session_id,
                name: format!("Group {}", i + 1),
                members,
                active: true,
                created_at: now,
            };
            for user in &group.members {
                self.membership.insert(*user, group.id);
            }
            self.groups.push(group);
        }
        log::info!(
            "Auto-assigned {} members into {} groups in session {}",
            online.len(),
            self.groups.len(),
            self.session_id
        );
        Ok(self.groups.clone())
    }

    /// Drop a departing session member from its group. No permission check.
    pub fn remove_member(&mut self, user: &UserId) -> Option<GroupId> {
        self.detach(user)
    }

    pub fn group_of(&self, user: &UserId) -> Option<GroupId> {
        self.membership.get(user).copied()
    }

    pub fn group(&self, group_id: &GroupId) -> Option<&BreakoutGroup> {
        self.groups.iter().find(|g| g.id == *group_id)
    }

    pub fn groups(&self) -> &[BreakoutGroup] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_core::Role;

    fn users(n: usize) -> Vec<UserId> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn leader() -> (UserId, Permissions) {
        (Uuid::new_v4(), Role::Leader.permissions())
    }

    #[test]
    fn test_balanced_sizes() {
        assert_eq!(balanced_sizes(10, 3), vec![3, 3, 2, 2]);
        assert_eq!(balanced_sizes(9, 3), vec![3, 3, 3]);
        assert_eq!(balanced_sizes(4, 4), vec![4]);
        assert_eq!(balanced_sizes(7, 2), vec![2, 2, 2, 1]);
        assert_eq!(balanced_sizes(5, 1), vec![1; 5]);
        assert!(balanced_sizes(0, 3).is_empty());
    }

    #[test]
    fn test_auto_assign_ten_by_three() {
        let (caller, perms) = leader();
        let online = users(10);
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let groups = c.auto_assign(caller, &perms, 3, &online, 0).unwrap();

        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);

        for user in &online {
            let count = groups.iter().filter(|g| g.contains(user)).count();
            assert_eq!(count, 1, "user must be in exactly one group");
            assert!(c.group_of(user).is_some());
        }
    }

    #[test]
    fn test_auto_assign_insufficient() {
        let (caller, perms) = leader();
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        assert_eq!(
            c.auto_assign(caller, &perms, 5, &users(4), 0),
            Err(CollabError::InsufficientMembers { requested: 5, available: 4 })
        );
        assert!(matches!(
            c.auto_assign(caller, &perms, 0, &users(4), 0),
            Err(CollabError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_auto_assign_replaces_existing_groups() {
        let (caller, perms) = leader();
        let online = users(6);
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        c.auto_assign(caller, &perms, 2, &online, 0).unwrap();
        c.auto_assign(caller, &perms, 3, &online, 0).unwrap();
        assert_eq!(c.groups().len(), 2);
    }

    #[test]
    fn test_member_in_at_most_one_group() {
        let (caller, perms) = leader();
        let u = users(1)[0];
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g1 = c.create_group(caller, &perms, "Titration", &[u], 0).unwrap();
        let g2 = c.create_group(caller, &perms, "Spectroscopy", &[], 0).unwrap();

        c.move_user_to_group(caller, &perms, u, g2.id).unwrap();
        assert_eq!(c.group_of(&u), Some(g2.id));
        assert!(!c.group(&g1.id).unwrap().contains(&u));
        assert!(c.group(&g2.id).unwrap().contains(&u));
    }

    #[test]
    fn test_self_join_and_leave_without_manage() {
        let (caller, perms) = leader();
        let student = Uuid::new_v4();
        let student_perms = Role::Member.permissions();
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g = c.create_group(caller, &perms, "A", &[], 0).unwrap();

        c.join_group(student, &student_perms, student, g.id).unwrap();
        assert_eq!(c.group_of(&student), Some(g.id));
        assert_eq!(c.leave_group(student, &student_perms, student).unwrap(), Some(g.id));
        assert_eq!(c.leave_group(student, &student_perms, student).unwrap(), None);
    }

    #[test]
    fn test_acting_on_others_requires_manage() {
        let (caller, perms) = leader();
        let (student, other) = (Uuid::new_v4(), Uuid::new_v4());
        let student_perms = Role::Member.permissions();
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g = c.create_group(caller, &perms, "A", &[other], 0).unwrap();

        assert!(matches!(
            c.join_group(student, &student_perms, other, g.id),
            Err(CollabError::PermissionDenied { .. })
        ));
        assert!(matches!(
            c.leave_group(student, &student_perms, other),
            Err(CollabError::PermissionDenied { .. })
        ));
        assert!(matches!(
            c.create_group(student, &student_perms, "B", &[], 0),
            Err(CollabError::PermissionDenied { .. })
        ));
        assert!(matches!(
            c.auto_assign(student, &student_perms, 1, &[student], 0),
            Err(CollabError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_join_unknown_group_keeps_membership() {
        let (caller, perms) = leader();
        let u = Uuid::new_v4();
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g = c.create_group(caller, &perms, "A", &[u], 0).unwrap();
        let bogus = Uuid::new_v4();
        assert_eq!(
            c.join_group(u, &Role::Member.permissions(), u, bogus),
            Err(CollabError::GroupNotFound(bogus))
        );
        assert_eq!(c.group_of(&u), Some(g.id));
    }

    #[test]
    fn test_close_group_releases_members() {
        let (caller, perms) = leader();
        let members = users(3);
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g = c.create_group(caller, &perms, "A", &members, 0).unwrap();
        let closed = c.close_group(caller, &perms, g.id).unwrap();
        assert!(!closed.active);
        assert_eq!(closed.len(), 3);
        assert!(c.groups().is_empty());
        assert!(members.iter().all(|m| c.group_of(m).is_none()));
    }

    #[test]
    fn test_remove_member() {
        let (caller, perms) = leader();
        let members = users(2);
        let mut c = BreakoutCoordinator::new(Uuid::new_v4());
        let g = c.create_group(caller, &perms, "A", &members, 0).unwrap();
        assert_eq!(c.remove_member(&members[0]), Some(g.id));
        assert_eq!(c.group(&g.id).unwrap().members, vec![members[1]]);
    }
}
