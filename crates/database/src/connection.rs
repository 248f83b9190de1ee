use crate::error::DbError;
use configuration::DatabaseSettings;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;

/// Parses the configured URL into connect options shared by both pools and
/// the lock manager's dedicated connections.
pub fn connect_options(settings: &DatabaseSettings) -> Result<PgConnectOptions, DbError> {
    PgConnectOptions::from_str(&settings.connection_url())
        .map_err(|e| DbError::ConnectionConfigError(e.to_string()))
}

/// Establishes a connection pool of the given size.
///
/// Idle connections are closed after `max_idle_time_secs` and callers give up
/// waiting for a connection after `acquire_timeout_secs`.
pub async fn connect(
    settings: &DatabaseSettings,
    options: PgConnectOptions,
    max_connections: u32,
) -> Result<PgPool, DbError> {
    if max_connections == 0 {
        return Err(DbError::ConnectionConfigError(
            "A pool needs at least one connection.".to_string(),
        ));
    }

    let pool = pool_options(settings, max_connections)
        .connect_with(options)
        .await?;

    tracing::debug!(max_connections, "Connected a database pool.");
    Ok(pool)
}

fn pool_options(settings: &DatabaseSettings, max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(settings.acquire_timeout())
        .idle_timeout(settings.max_idle_time())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_options_come_from_the_settings() {
        let mut settings = DatabaseSettings::default();
        settings.host = "db.example".to_string();
        settings.port = 5433;

        let options = connect_options(&settings).expect("valid url");
        assert_eq!(options.get_host(), "db.example");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("wres"));
    }

    #[test]
    fn a_malformed_url_is_a_configuration_error() {
        let settings = DatabaseSettings {
            url: Some("not a url".to_string()),
            ..DatabaseSettings::default()
        };
        assert!(matches!(
            connect_options(&settings),
            Err(DbError::ConnectionConfigError(_))
        ));
    }

    #[tokio::test]
    async fn a_zero_sized_pool_is_refused() {
        let settings = DatabaseSettings::default();
        let options = connect_options(&settings).expect("valid url");
        assert!(matches!(
            connect(&settings, options, 0).await,
            Err(DbError::ConnectionConfigError(_))
        ));
    }
}
