use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    /// Whole-URL override; when set, the discrete POSTGRES_* options are ignored.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    #[arg(long, env = "POSTGRES_DATABASE", default_value = "postgres")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct RedisArgs {
    /// Whole-URL override; when set, the discrete REDIS_* options are ignored.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long, env = "REDIS_USERNAME")]
    pub redis_username: Option<String>,

    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    #[arg(long, env = "REDIS_PROTO", default_value = "redis")]
    pub redis_proto: String,
}

impl RedisArgs {
    pub fn url_redacted(&self) -> String {
        if let Some(ref url) = self.redis_url {
            return redact_userinfo(url);
        }
        format!(
            "{}://{}:{}@{}:{}",
            self.proto(),
            self.redis_username.as_deref().unwrap_or(""),
            self.redis_password.as_deref().map(|_| "****").unwrap_or(""),
            self.redis_host,
            self.redis_port
        )
    }

    pub fn url(&self) -> String {
        if let Some(ref url) = self.redis_url {
            return url.clone();
        }
        let mut url = format!("{}://", self.proto());
        if let Some(ref username) = self.redis_username {
            url.push_str(username);
            if let Some(ref password) = self.redis_password {
                url.push(':');
                url.push_str(password);
            }
            url.push('@');
        } else if let Some(ref password) = self.redis_password {
            url.push(':');
            url.push_str(password);
            url.push('@');
        }
        url.push_str(&format!("{}:{}/", self.redis_host, self.redis_port));
        url
    }

    fn proto(&self) -> &str {
        if self.redis_proto.is_empty() {
            "redis"
        } else {
            &self.redis_proto
        }
    }
}

fn redact_userinfo(url: &str) -> String {
    match (url.find("://"), url.find('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}****{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[derive(Parser, Debug, Clone)]
pub struct RateLimiterArgs {
    /// Max requests allowed in the burst window
    #[arg(long, env = "RATE_LIMITER_BURST_LIMIT", default_value_t = 50)]
    pub burst_limit: i64,

    /// Burst window length in milliseconds (e.g. 5000 = 5s)
    #[arg(long, env = "RATE_LIMITER_BURST_WINDOW_MS", default_value_t = 5000)]
    pub burst_window_ms: i64,

    /// Max requests allowed in the long-term window
    #[arg(long, env = "RATE_LIMITER_LONG_LIMIT", default_value_t = 250)]
    pub long_limit: i64,

    /// Long-term window length in milliseconds (e.g. 60000 = 60s)
    #[arg(long, env = "RATE_LIMITER_LONG_WINDOW_MS", default_value_t = 60000)]
    pub long_window_ms: i64,

    /// Max list length to keep per key (upper bound on work per check)
    #[arg(long, env = "RATE_LIMITER_MAX_LIST_SIZE", default_value_t = 1000)]
    pub max_list_size: i64,

    /// Optional key prefix
    #[arg(long, env = "RATE_LIMITER_KEY_PREFIX", default_value = "rate:")]
    pub key_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_override_wins() {
        let args = RedisArgs {
            redis_url: Some("rediss://user:pw@example.com:6380/".into()),
            redis_host: "ignored".into(),
            redis_port: 1,
            redis_username: None,
            redis_password: None,
            redis_proto: "redis".into(),
        };
        assert_eq!(args.url(), "rediss://user:pw@example.com:6380/");
        assert_eq!(args.url_redacted(), "rediss://****@example.com:6380/");
    }

    #[test]
    fn redis_url_from_parts() {
        let args = RedisArgs {
            redis_url: None,
            redis_host: "10.0.0.5".into(),
            redis_port: 6379,
            redis_username: None,
            redis_password: Some("hunter2".into()),
            redis_proto: "redis".into(),
        };
        assert_eq!(args.url(), "redis://:hunter2@10.0.0.5:6379/");
        assert!(!args.url_redacted().contains("hunter2"));
    }
}
