use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_delete_policy, parse_environment,
    parse_millis, parse_seconds, parse_strategy, parse_u16, parse_u32, parse_u64,
    parse_unit_interval,
};
use super::types::{
    AiSettings, ConfigError, DatabaseSettings, GradingSettings, RedisSettings, RuntimeSettings,
    S3Settings, ServerHost, ServerPort, ServerSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("MARKWISE_HOST", "0.0.0.0");
        let port = env_or_default("MARKWISE_PORT", "8080");

        let environment = parse_environment(
            env_optional("MARKWISE_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("MARKWISE_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "markwise");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "markwise");
        let database_url = env_optional("DATABASE_URL");
        let max_connections =
            parse_u32("DATABASE_MAX_CONNECTIONS", env_or_default("DATABASE_MAX_CONNECTIONS", "20"))?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let embedding_model = env_or_default("EMBEDDING_MODEL", "text-embedding-3-small");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "500"))?;
        let ai_temperature =
            parse_unit_interval("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "60"))?;
        let strategy = parse_strategy(env_or_default("COMPARISON_STRATEGY", "embedding"))?;
        let ocr_enabled =
            env_optional("OCR_ENABLED").map(|value| parse_bool(&value)).unwrap_or(true);
        let ocr_model = env_or_default("AI_OCR_MODEL", "gpt-4o-mini");
        let ocr_max_pages =
            parse_u64("OCR_MAX_PAGES", env_or_default("OCR_MAX_PAGES", "20"))? as usize;
        let feedback_enabled =
            env_optional("AI_FEEDBACK_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://storage.yandexcloud.net");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "markwise-documents");
        let s3_region = env_or_default("S3_REGION", "ru-central1");

        let max_document_size_mb =
            parse_u64("MAX_DOCUMENT_SIZE_MB", env_or_default("MAX_DOCUMENT_SIZE_MB", "10"))?;
        let max_bulk_upload =
            parse_u64("MAX_BULK_UPLOAD", env_or_default("MAX_BULK_UPLOAD", "50"))? as usize;
        let similarity_floor =
            parse_unit_interval("SIMILARITY_FLOOR", env_or_default("SIMILARITY_FLOOR", "0.2"))?;
        let keyword_weight = parse_unit_interval(
            "KEYWORD_MATCH_WEIGHT",
            env_or_default("KEYWORD_MATCH_WEIGHT", "0"),
        )?;
        let max_attempts =
            parse_u32("GRADING_MAX_RETRIES", env_or_default("GRADING_MAX_RETRIES", "3"))?;
        let backoff_base = parse_millis(
            "GRADING_BACKOFF_BASE_MS",
            env_or_default("GRADING_BACKOFF_BASE_MS", "2000"),
        )?;
        let backoff_max = parse_millis(
            "GRADING_BACKOFF_MAX_MS",
            env_or_default("GRADING_BACKOFF_MAX_MS", "60000"),
        )?;
        let parallelism =
            parse_u64("GRADING_PARALLELISM", env_or_default("GRADING_PARALLELISM", "5"))? as usize;
        let conflict_retries = parse_u32(
            "GRADING_CONFLICT_RETRIES",
            env_or_default("GRADING_CONFLICT_RETRIES", "5"),
        )?;
        let delete_policy =
            parse_delete_policy(env_or_default("MODEL_ANSWER_DELETE_POLICY", "reject"))?;
        let lease_ttl = parse_seconds(
            "GRADING_LEASE_TTL_SECONDS",
            env_or_default("GRADING_LEASE_TTL_SECONDS", "900"),
        )?;
        let sweep_interval = parse_seconds(
            "GRADING_SWEEP_INTERVAL_SECONDS",
            env_or_default("GRADING_SWEEP_INTERVAL_SECONDS", "30"),
        )?;
        let stale_after = parse_seconds(
            "GRADING_STALE_AFTER_SECONDS",
            env_or_default("GRADING_STALE_AFTER_SECONDS", "900"),
        )?;

        let log_level = env_or_default("MARKWISE_LOG_LEVEL", "info");
        let json = env_optional("MARKWISE_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings { host: ServerHost::parse(host)?, port: ServerPort::parse(port)? },
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                embedding_model,
                ai_max_tokens,
                ai_temperature,
                ai_request_timeout,
                strategy,
                ocr_enabled,
                ocr_model,
                feedback_enabled,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            grading: GradingSettings {
                similarity_floor,
                keyword_weight,
                max_attempts,
                backoff_base,
                backoff_max,
                parallelism,
                conflict_retries,
                compare_timeout: std::time::Duration::from_secs(ai_request_timeout),
                max_document_bytes: (max_document_size_mb as usize) * 1024 * 1024,
                ocr_max_pages,
                max_bulk_upload,
                delete_policy,
                lease_ttl,
                sweep_interval,
                stale_after,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.grading.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_MAX_RETRIES",
                value: String::from("0"),
            });
        }

        if self.grading.parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_PARALLELISM",
                value: String::from("0"),
            });
        }

        if self.grading.max_bulk_upload == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_BULK_UPLOAD",
                value: String::from("0"),
            });
        }

        if self.grading.backoff_max < self.grading.backoff_base {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_BACKOFF_MAX_MS",
                value: self.grading.backoff_max.as_millis().to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }

        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}
