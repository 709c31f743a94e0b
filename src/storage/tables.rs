use redb::TableDefinition;

/// Expiration index: "{deadline_ms:020}\x1e{table}\x1e{row_key}" -> ""
pub const ROW_EXPIRY: TableDefinition<&str, &str> = TableDefinition::new("row_expiry");

/// Logical table handle. Every physical row lives in exactly one of these and
/// is addressed by a `RowKey` (partition + clustering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// realm_id -> Realm
    Realms,
    /// Forward mapping for realm attributes: (scope, realm_id) / name -> values
    RealmAttributes,
    /// Reverse mapping for realm attributes: (scope, name, value) / realm_id
    AttributeRealms,
    /// realm_id / client uuid -> Client
    Clients,
    ClientAttributes,
    AttributeClients,
    /// realm_id / user_id -> User
    Users,
    UserAttributes,
    AttributeUsers,
    /// realm_id / session key -> UserSession (TTL), offline copies under their own key
    UserSessions,
    UserSessionAttributes,
    AttributeUserSessions,
    /// realm_id / client_session_id -> ClientSession (TTL)
    ClientSessions,
    /// realm_id / root_id -> RootAuthenticationSession (TTL)
    AuthSessions,
    /// realm_id / user_id -> LoginFailure
    LoginFailures,
    /// key -> SingleUseObject (TTL)
    SingleUseObjects,
    /// Aggregate container: realm_id -> RealmRoles
    RealmRoles,
    /// Aggregate container: realm_id -> RealmGroups
    RealmGroups,
    /// Aggregate container: realm_id -> RealmClientScopes
    RealmClientScopes,
}

impl Table {
    pub const ALL: [Table; 19] = [
        Table::Realms,
        Table::RealmAttributes,
        Table::AttributeRealms,
        Table::Clients,
        Table::ClientAttributes,
        Table::AttributeClients,
        Table::Users,
        Table::UserAttributes,
        Table::AttributeUsers,
        Table::UserSessions,
        Table::UserSessionAttributes,
        Table::AttributeUserSessions,
        Table::ClientSessions,
        Table::AuthSessions,
        Table::LoginFailures,
        Table::SingleUseObjects,
        Table::RealmRoles,
        Table::RealmGroups,
        Table::RealmClientScopes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Realms => "realms",
            Table::RealmAttributes => "realm_attributes",
            Table::AttributeRealms => "attribute_realms",
            Table::Clients => "clients",
            Table::ClientAttributes => "client_attributes",
            Table::AttributeClients => "attribute_clients",
            Table::Users => "users",
            Table::UserAttributes => "user_attributes",
            Table::AttributeUsers => "attribute_users",
            Table::UserSessions => "user_sessions",
            Table::UserSessionAttributes => "user_session_attributes",
            Table::AttributeUserSessions => "attribute_user_sessions",
            Table::ClientSessions => "client_sessions",
            Table::AuthSessions => "auth_sessions",
            Table::LoginFailures => "login_failures",
            Table::SingleUseObjects => "single_use_objects",
            Table::RealmRoles => "realm_roles",
            Table::RealmGroups => "realm_groups",
            Table::RealmClientScopes => "realm_client_scopes",
        }
    }

    pub fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(self.name())
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }
}
