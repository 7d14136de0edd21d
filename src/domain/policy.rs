//! Which roles may perform which action. Handlers check this table once per
//! request instead of testing role membership inline.

use crate::domain::roles::{Role, RoleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ViewSchools,
    ManageSchools,
    ViewUsers,
    ManageUsers,
    ViewClasses,
    ManageClasses,
    AssignTeacher,
    ViewStudents,
    ManageStudents,
    UpdateGrades,
    ViewReports,
    ManageReportTemplates,
}

use Role::{Admin, Parent, Superadmin, Teacher};

static POLICY: &[(Action, &[Role])] = &[
    (Action::ViewSchools, &[Superadmin, Admin, Teacher, Parent]),
    (Action::ManageSchools, &[Superadmin]),
    (Action::ViewUsers, &[Superadmin, Admin]),
    (Action::ManageUsers, &[Superadmin, Admin]),
    (Action::ViewClasses, &[Superadmin, Admin, Teacher]),
    (Action::ManageClasses, &[Superadmin, Admin]),
    (Action::AssignTeacher, &[Superadmin, Admin]),
    (Action::ViewStudents, &[Superadmin, Admin, Teacher, Parent]),
    (Action::ManageStudents, &[Superadmin, Admin]),
    (Action::UpdateGrades, &[Teacher]),
    (Action::ViewReports, &[Superadmin, Admin, Teacher, Parent]),
    (Action::ManageReportTemplates, &[Superadmin, Admin]),
];

pub fn allowed_roles(action: Action) -> &'static [Role] {
    POLICY
        .iter()
        .find(|(a, _)| *a == action)
        .map(|(_, roles)| *roles)
        .unwrap_or(&[])
}

pub fn allows(action: Action, roles: &RoleSet) -> bool {
    roles.intersects(allowed_roles(action))
}
