//! SQL for the connection census.

/// Builds version-aware census query over pg_stat_activity.
///
/// Returns four text columns in order: user, client host, database
/// (nullable), and the session state in processlist vocabulary (`Query` for
/// active sessions, `Sleep` for idle ones, anything else verbatim, NULL as
/// empty).
///
/// The host never carries a port and never contains `:`: IPv6 addresses are
/// written with `_` in place of colons (`::1` becomes `__1`), so host
/// normalization cannot cut them short.
pub fn build_census_query(server_version: Option<f64>) -> String {
    // backend_type exists since PostgreSQL 10; it names background workers
    // that have no login role.
    let user_expr = if server_version.unwrap_or(0.0) >= 10.0 {
        "COALESCE(usename::text, backend_type, '')"
    } else {
        "COALESCE(usename::text, '')"
    };

    format!(
        r#"
            SELECT
                {user_expr} as usename,
                COALESCE(
                    client_hostname,
                    CASE WHEN family(client_addr) = 6
                        THEN replace(host(client_addr), ':', '_')
                        ELSE host(client_addr)
                    END,
                    ''
                ) as client_host,
                datname::text as datname,
                CASE state
                    WHEN 'active' THEN 'Query'
                    WHEN 'idle' THEN 'Sleep'
                    ELSE COALESCE(state, '')
                END as command
            FROM pg_stat_activity
        "#
    )
}
