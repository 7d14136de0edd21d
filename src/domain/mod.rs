pub mod bulk;
pub mod grades;
pub mod policy;
pub mod roles;
pub mod scope;
pub mod validate;
