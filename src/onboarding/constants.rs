//! Onboarding constants
//!
//! Platform paths, SCIM schema URNs and well-known values used by the
//! onboarding stages.

/// Name (and id) of the userstore every new organization is provisioned with
pub const DEFAULT_USERSTORE: &str = "DEFAULT";

/// SCIM error subtype returned while the organization's userstore is not attached
pub const INVALID_USERSTORE_SCIM_TYPE: &str = "Invalid user store name.";

/// SCIM core user schema
pub const SCIM_USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";

/// SCIM patch operation message schema
pub const SCIM_PATCH_OP_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:PatchOp";

/// Token endpoint, relative to the root organization URL
pub const TOKEN_PATH: &str = "/oauth2/token";

/// Organization management API, relative to the root organization URL
pub const ORGANIZATIONS_PATH: &str = "/api/server/v1/organizations";

/// Name availability check, relative to the root organization URL
pub const CHECK_NAME_PATH: &str = "/api/server/v1/organizations/check-name";

/// Userstore listing, relative to an organization URL
pub const USERSTORES_PATH: &str = "/api/server/v1/userstores";

/// Application listing, relative to an organization URL
pub const APPLICATIONS_PATH: &str = "/api/server/v1/applications";

/// SCIM users endpoint, relative to an organization URL
pub const SCIM_USERS_PATH: &str = "/scim2/Users";

/// SCIM v2 roles endpoint, relative to an organization URL
pub const SCIM_ROLES_PATH: &str = "/scim2/v2/Roles";
