//! Session expiration from layered realm and client timeout policies.
//!
//! All policy values are whole seconds; instants are epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Realm-wide timeout policy, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmTimeouts {
    pub sso_session_idle_timeout: i64,
    pub sso_session_max_lifespan: i64,
    /// `0` means "same as the regular SSO value"
    pub sso_session_idle_timeout_remember_me: i64,
    pub sso_session_max_lifespan_remember_me: i64,
    pub offline_session_idle_timeout: i64,
    pub offline_session_max_lifespan_enabled: bool,
    pub offline_session_max_lifespan: i64,
    /// Realm defaults for the per-client overrides; `0` means unset
    pub client_session_idle_timeout: i64,
    pub client_session_max_lifespan: i64,
    pub client_offline_session_idle_timeout: i64,
    pub client_offline_session_max_lifespan: i64,
    pub access_code_lifespan: i64,
    pub access_code_lifespan_login: i64,
    pub access_code_lifespan_user_action: i64,
}

impl Default for RealmTimeouts {
    fn default() -> Self {
        Self {
            sso_session_idle_timeout: 1800,          // 30 minutes
            sso_session_max_lifespan: 36000,         // 10 hours
            sso_session_idle_timeout_remember_me: 0,
            sso_session_max_lifespan_remember_me: 0,
            offline_session_idle_timeout: 2_592_000, // 30 days
            offline_session_max_lifespan_enabled: false,
            offline_session_max_lifespan: 5_184_000, // 60 days
            client_session_idle_timeout: 0,
            client_session_max_lifespan: 0,
            client_offline_session_idle_timeout: 0,
            client_offline_session_max_lifespan: 0,
            access_code_lifespan: 60,
            access_code_lifespan_login: 1800,
            access_code_lifespan_user_action: 300,
        }
    }
}

impl RealmTimeouts {
    /// Lifespan of an authentication session: the longest access-code lifespan.
    pub fn auth_session_lifespan(&self) -> i64 {
        self.access_code_lifespan
            .max(self.access_code_lifespan_login)
            .max(self.access_code_lifespan_user_action)
    }
}

/// Per-client overrides, in seconds. `None` falls back to the realm's
/// client-session default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    pub session_idle_timeout: Option<i64>,
    pub session_max_lifespan: Option<i64>,
    pub offline_session_idle_timeout: Option<i64>,
    pub offline_session_max_lifespan: Option<i64>,
}

/// The instants and flags of the record being expired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTimes {
    /// Session start, epoch milliseconds
    pub started: i64,
    /// Last refresh, epoch milliseconds
    pub last_refresh: i64,
    pub remember_me: bool,
    pub offline: bool,
}

fn millis(seconds: i64) -> i64 {
    seconds.saturating_mul(1000)
}

/// Override if present, else the realm default. Only a positive result clamps.
fn client_limit(client: Option<i64>, realm_default: i64) -> Option<i64> {
    Some(client.unwrap_or(realm_default)).filter(|v| *v > 0)
}

/// A configured remember-me value only ever extends the regular one.
fn with_remember_me(regular: i64, remember_me_value: i64, remember_me: bool) -> i64 {
    if remember_me && remember_me_value > 0 {
        regular.max(remember_me_value)
    } else {
        regular
    }
}

/// Absolute expiration of a user session (`client = None`) or of a client
/// session (`client = Some(..)`).
pub fn session_expiration(
    realm: &RealmTimeouts,
    client: Option<&ClientTimeouts>,
    times: SessionTimes,
) -> i64 {
    if times.offline {
        offline_expiration(realm, client, times)
    } else {
        online_expiration(realm, client, times)
    }
}

fn online_expiration(
    realm: &RealmTimeouts,
    client: Option<&ClientTimeouts>,
    times: SessionTimes,
) -> i64 {
    let max_lifespan = with_remember_me(
        realm.sso_session_max_lifespan,
        realm.sso_session_max_lifespan_remember_me,
        times.remember_me,
    );
    let mut session_expires = times.started.saturating_add(millis(max_lifespan));

    let idle = with_remember_me(
        realm.sso_session_idle_timeout,
        realm.sso_session_idle_timeout_remember_me,
        times.remember_me,
    );
    let mut expiration = times.last_refresh.saturating_add(millis(idle));

    if let Some(client) = client {
        if let Some(limit) =
            client_limit(client.session_max_lifespan, realm.client_session_max_lifespan)
        {
            session_expires = session_expires.min(times.started.saturating_add(millis(limit)));
        }
        if let Some(limit) =
            client_limit(client.session_idle_timeout, realm.client_session_idle_timeout)
        {
            expiration = expiration.min(times.last_refresh.saturating_add(millis(limit)));
        }
    }

    expiration.min(session_expires)
}

fn offline_expiration(
    realm: &RealmTimeouts,
    client: Option<&ClientTimeouts>,
    times: SessionTimes,
) -> i64 {
    let mut session_expires = None;
    if realm.offline_session_max_lifespan_enabled {
        let mut expires = times
            .started
            .saturating_add(millis(realm.offline_session_max_lifespan));
        if let Some(limit) = client.and_then(|c| {
            client_limit(
                c.offline_session_max_lifespan,
                realm.client_offline_session_max_lifespan,
            )
        }) {
            expires = expires.min(times.started.saturating_add(millis(limit)));
        }
        session_expires = Some(expires);
    }

    let mut expiration = times
        .last_refresh
        .saturating_add(millis(realm.offline_session_idle_timeout));
    if let Some(limit) = client.and_then(|c| {
        client_limit(
            c.offline_session_idle_timeout,
            realm.client_offline_session_idle_timeout,
        )
    }) {
        expiration = expiration.min(times.last_refresh.saturating_add(millis(limit)));
    }

    match session_expires {
        Some(expires) => expiration.min(expires),
        None => expiration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const T: i64 = 1_700_000_000_000;

    fn at(started: i64, last_refresh: i64) -> SessionTimes {
        SessionTimes {
            started,
            last_refresh,
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_session_expires_after_idle_timeout() {
        let realm = RealmTimeouts::default();
        assert_eq!(session_expiration(&realm, None, at(T, T)), T + 1_800_000);
    }

    #[test]
    fn test_client_idle_override_tightens() {
        let realm = RealmTimeouts::default();
        let client = ClientTimeouts {
            session_idle_timeout: Some(600),
            ..Default::default()
        };
        assert_eq!(session_expiration(&realm, Some(&client), at(T, T)), T + 600_000);
    }

    #[test]
    fn test_client_override_never_loosens() {
        let realm = RealmTimeouts::default();
        let client = ClientTimeouts {
            session_idle_timeout: Some(7200),
            ..Default::default()
        };
        assert_eq!(session_expiration(&realm, Some(&client), at(T, T)), T + 1_800_000);
    }

    #[test]
    fn test_client_override_falls_back_to_realm_default() {
        let realm = RealmTimeouts {
            client_session_idle_timeout: 300,
            ..Default::default()
        };
        let unset = ClientTimeouts::default();
        assert_eq!(session_expiration(&realm, Some(&unset), at(T, T)), T + 300_000);

        // an explicit zero on the client disables the realm default
        let disabled = ClientTimeouts {
            session_idle_timeout: Some(0),
            ..Default::default()
        };
        assert_eq!(session_expiration(&realm, Some(&disabled), at(T, T)), T + 1_800_000);

        // user sessions ignore client policy entirely
        assert_eq!(session_expiration(&realm, None, at(T, T)), T + 1_800_000);
    }

    #[test]
    fn test_max_lifespan_caps_refreshed_session() {
        let realm = RealmTimeouts::default();
        let refreshed = T + 35_000_000;
        assert_eq!(session_expiration(&realm, None, at(T, refreshed)), T + 36_000_000);

        let client = ClientTimeouts {
            session_max_lifespan: Some(3600),
            ..Default::default()
        };
        assert_eq!(
            session_expiration(&realm, Some(&client), at(T, T + 3_000_000)),
            T + 3_600_000
        );
    }

    #[test]
    fn test_remember_me_extends() {
        let realm = RealmTimeouts {
            sso_session_idle_timeout_remember_me: 86_400,
            sso_session_max_lifespan_remember_me: 604_800,
            ..Default::default()
        };
        let times = SessionTimes {
            remember_me: true,
            ..at(T, T)
        };
        assert_eq!(session_expiration(&realm, None, times), T + 86_400_000);

        // without remember-me the regular policy applies
        assert_eq!(session_expiration(&realm, None, at(T, T)), T + 1_800_000);
    }

    #[test]
    fn test_remember_me_without_configuration_is_ignored() {
        let realm = RealmTimeouts::default();
        let times = SessionTimes {
            remember_me: true,
            ..at(T, T)
        };
        assert_eq!(session_expiration(&realm, None, times), T + 1_800_000);
    }

    #[test]
    fn test_offline_ignores_max_lifespan_unless_enabled() {
        let mut realm = RealmTimeouts::default();
        let times = SessionTimes {
            offline: true,
            ..at(T, T + 5_000_000_000)
        };
        assert_eq!(
            session_expiration(&realm, None, times),
            T + 5_000_000_000 + 2_592_000_000
        );

        realm.offline_session_max_lifespan_enabled = true;
        assert_eq!(session_expiration(&realm, None, times), T + 5_184_000_000);
    }

    #[test]
    fn test_offline_client_overrides() {
        let realm = RealmTimeouts {
            offline_session_max_lifespan_enabled: true,
            ..Default::default()
        };
        let client = ClientTimeouts {
            offline_session_idle_timeout: Some(3600),
            offline_session_max_lifespan: Some(1800),
            // online overrides do not apply to offline sessions
            session_idle_timeout: Some(60),
            ..Default::default()
        };
        let times = SessionTimes {
            offline: true,
            ..at(T, T)
        };
        assert_eq!(session_expiration(&realm, Some(&client), times), T + 1_800_000);

        let realm = RealmTimeouts::default();
        assert_eq!(session_expiration(&realm, Some(&client), times), T + 3_600_000);
    }

    #[test]
    fn test_auth_session_lifespan_is_longest_access_code() {
        let realm = RealmTimeouts::default();
        assert_eq!(realm.auth_session_lifespan(), 1800);
    }

    fn timeouts() -> impl Strategy<Value = RealmTimeouts> {
        (
            (0i64..100_000, 0i64..100_000, 0i64..100_000, 0i64..100_000),
            (0i64..100_000, any::<bool>(), 0i64..100_000),
            (0i64..10_000, 0i64..10_000, 0i64..10_000, 0i64..10_000),
        )
            .prop_map(
                |(
                    (idle, max, rm_idle, rm_max),
                    (off_idle, off_enabled, off_max),
                    (c_idle, c_max, co_idle, co_max),
                )| RealmTimeouts {
                    sso_session_idle_timeout: idle,
                    sso_session_max_lifespan: max,
                    sso_session_idle_timeout_remember_me: rm_idle,
                    sso_session_max_lifespan_remember_me: rm_max,
                    offline_session_idle_timeout: off_idle,
                    offline_session_max_lifespan_enabled: off_enabled,
                    offline_session_max_lifespan: off_max,
                    client_session_idle_timeout: c_idle,
                    client_session_max_lifespan: c_max,
                    client_offline_session_idle_timeout: co_idle,
                    client_offline_session_max_lifespan: co_max,
                    ..Default::default()
                },
            )
    }

    fn client_timeouts() -> impl Strategy<Value = ClientTimeouts> {
        (
            proptest::option::of(0i64..10_000),
            proptest::option::of(0i64..10_000),
            proptest::option::of(0i64..10_000),
            proptest::option::of(0i64..10_000),
        )
            .prop_map(|(idle, max, off_idle, off_max)| ClientTimeouts {
                session_idle_timeout: idle,
                session_max_lifespan: max,
                offline_session_idle_timeout: off_idle,
                offline_session_max_lifespan: off_max,
            })
    }

    fn session_times() -> impl Strategy<Value = SessionTimes> {
        (0i64..1_000_000_000, 0i64..1_000_000_000, any::<bool>(), any::<bool>()).prop_map(
            |(started, since, remember_me, offline)| SessionTimes {
                started,
                last_refresh: started + since,
                remember_me,
                offline,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_longer_realm_timeouts_never_shorten(
            realm in timeouts(),
            client in proptest::option::of(client_timeouts()),
            times in session_times(),
            extra in 1i64..100_000,
            which in 0usize..6,
        ) {
            let mut longer = realm;
            match which {
                0 => longer.sso_session_idle_timeout += extra,
                1 => longer.sso_session_max_lifespan += extra,
                2 => longer.sso_session_idle_timeout_remember_me += extra,
                3 => longer.sso_session_max_lifespan_remember_me += extra,
                4 => longer.offline_session_idle_timeout += extra,
                _ => longer.offline_session_max_lifespan += extra,
            }
            let before = session_expiration(&realm, client.as_ref(), times);
            let after = session_expiration(&longer, client.as_ref(), times);
            prop_assert!(after >= before);
        }

        #[test]
        fn prop_remember_me_never_shortens(
            realm in timeouts(),
            client in proptest::option::of(client_timeouts()),
            times in session_times(),
        ) {
            let forgotten = SessionTimes { remember_me: false, ..times };
            let remembered = SessionTimes { remember_me: true, ..times };
            prop_assert!(
                session_expiration(&realm, client.as_ref(), remembered)
                    >= session_expiration(&realm, client.as_ref(), forgotten)
            );
        }

        #[test]
        fn prop_longer_positive_client_override_never_shortens(
            realm in timeouts(),
            times in session_times(),
            base in 1i64..10_000,
            extra in 1i64..10_000,
        ) {
            let tight = ClientTimeouts {
                session_idle_timeout: Some(base),
                session_max_lifespan: Some(base),
                offline_session_idle_timeout: Some(base),
                offline_session_max_lifespan: Some(base),
            };
            let loose = ClientTimeouts {
                session_idle_timeout: Some(base + extra),
                session_max_lifespan: Some(base + extra),
                offline_session_idle_timeout: Some(base + extra),
                offline_session_max_lifespan: Some(base + extra),
            };
            prop_assert!(
                session_expiration(&realm, Some(&loose), times)
                    >= session_expiration(&realm, Some(&tight), times)
            );
        }
    }
}
