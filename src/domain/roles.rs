use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Superadmin,
    Admin,
    Teacher,
    Parent,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Superadmin, Role::Admin, Role::Teacher, Role::Parent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = RoleError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "superadmin" | "super_admin" | "super-admin" => Ok(Role::Superadmin),
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "parent" => Ok(Role::Parent),
            _ => Err(RoleError::Unknown(value.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("unknown role `{0}`")]
    Unknown(String),
    #[error("a user must keep at least one role")]
    LastRole,
}

/// Duplicate-free role collection, kept in `Role` order so stored arrays are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(Vec<Role>);

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from stored strings, skipping anything that is not a known role.
    pub fn from_strings<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut set = Self::new();
        for value in raw {
            if let Ok(role) = Role::try_from(value.as_ref()) {
                set.add(role);
            }
        }
        set
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    pub fn intersects(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.contains(*r))
    }

    /// Returns `false` when the role was already present.
    pub fn add(&mut self, role: Role) -> bool {
        if self.contains(role) {
            return false;
        }
        self.0.push(role);
        self.0.sort();
        true
    }

    /// Removing an absent role is a no-op; removing the only remaining role is refused.
    pub fn remove(&mut self, role: Role) -> Result<bool, RoleError> {
        if !self.contains(role) {
            return Ok(false);
        }
        if self.0.len() == 1 {
            return Err(RoleError::LastRole);
        }
        self.0.retain(|r| *r != role);
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.0.iter()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|r| r.as_str().to_string()).collect()
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<T: IntoIterator<Item = Role>>(iter: T) -> Self {
        let mut set = RoleSet::new();
        for role in iter {
            set.add(role);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(Role::try_from("Teacher"), Ok(Role::Teacher));
        assert_eq!(Role::try_from(" superadmin "), Ok(Role::Superadmin));
        assert!(matches!(Role::try_from("janitor"), Err(RoleError::Unknown(_))));
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut roles = RoleSet::new();
        assert!(roles.add(Role::Teacher));
        assert!(!roles.add(Role::Teacher));
        assert_eq!(roles.len(), 1);
    }

    #[test]
    fn test_roles_kept_sorted() {
        let roles: RoleSet = [Role::Parent, Role::Admin, Role::Parent].into_iter().collect();
        assert_eq!(roles.to_strings(), vec!["admin", "parent"]);
    }

    #[test]
    fn test_remove_last_role_rejected() {
        let mut roles: RoleSet = [Role::Admin, Role::Teacher].into_iter().collect();
        assert_eq!(roles.remove(Role::Admin), Ok(true));
        assert_eq!(roles.remove(Role::Parent), Ok(false));
        assert_eq!(roles.remove(Role::Teacher), Err(RoleError::LastRole));
        assert!(roles.contains(Role::Teacher));
    }

    #[test]
    fn test_from_strings_skips_unknown() {
        let roles = RoleSet::from_strings(&["teacher", "ghost", "TEACHER", "parent"]);
        assert_eq!(roles.to_strings(), vec!["teacher", "parent"]);
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let roles: RoleSet = [Role::Teacher, Role::Superadmin].into_iter().collect();
        let json = serde_json::to_string(&roles).unwrap();
        assert_eq!(json, r#"["superadmin","teacher"]"#);
    }
}
