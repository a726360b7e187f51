use std::env;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use deadpool_postgres::{Config as PgConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres::NoTls;
use rustls::pki_types::CertificateDer;

use crate::args::PostgresArgs;

/// Build the connection pool. `DATABASE_URL` (when present) wins over the
/// discrete POSTGRES_* options.
pub async fn create_pool(pg_args: PostgresArgs) -> Result<Pool> {
    let mut pg_pool_cfg = PgConfig::new();
    if let Some(ref url) = pg_args.database_url {
        let parsed =
            tokio_postgres::Config::from_str(url).context("failed to parse DATABASE_URL")?;
        pg_pool_cfg.host = parsed.get_hosts().first().and_then(|h| match h {
            tokio_postgres::config::Host::Tcp(host) => Some(host.clone()),
            #[allow(unreachable_patterns)]
            _ => None,
        });
        pg_pool_cfg.port = parsed.get_ports().first().copied();
        pg_pool_cfg.dbname = parsed.get_dbname().map(|s| s.to_string());
        pg_pool_cfg.user = parsed.get_user().map(|s| s.to_string());
        pg_pool_cfg.password = parsed
            .get_password()
            .map(|p| String::from_utf8_lossy(p).into_owned());
    } else {
        pg_pool_cfg.host = Some(pg_args.postgres_host);
        pg_pool_cfg.port = Some(pg_args.postgres_port);
        pg_pool_cfg.dbname = Some(pg_args.postgres_database);
        pg_pool_cfg.user = Some(pg_args.postgres_username);
        pg_pool_cfg.password = pg_args
            .postgres_password
            .or_else(|| env::var("POSTGRES_PASSWORD").ok());
    }
    pg_pool_cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let tls_connector = match pg_args.postgres_ca_cert {
        Some(ref ca_cert) => {
            let extra_roots = parse_ca_certs(ca_cert.as_bytes())
                .context("failed to parse POSTGRES_CA_CERT")?;
            Some(crate::make_rustls(extra_roots).context("failed to build TLS connector")?)
        }
        None => None,
    };

    let pool = match tls_connector {
        Some(tls) => pg_pool_cfg
            .create_pool(Some(Runtime::Tokio1), tls)
            .context("failed to create Postgres pool")?,
        None => pg_pool_cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create Postgres pool")?,
    };
    Ok(pool)
}

fn parse_ca_certs(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    // PEM bundles carry one or more certs; anything else is raw DER.
    if bytes.starts_with(b"-----BEGIN") {
        let mut rd: &[u8] = bytes;
        let mut out = Vec::new();
        for item in rustls_pemfile::read_all(&mut rd) {
            let item = item.map_err(|e| anyhow::anyhow!("failed to parse PEM bundle: {}", e))?;
            if let rustls_pemfile::Item::X509Certificate(der) = item {
                out.push(der);
            }
        }
        if out.is_empty() {
            bail!("no X509 certificates found in provided PEM");
        }
        Ok(out)
    } else {
        Ok(vec![CertificateDer::from(bytes.to_vec())])
    }
}
