use anyhow::{Context, Result, bail};
use crate::cache_controller::DEFAULT_PARTITION_CAPACITY;
use clap::{Parser, ValueEnum};
use std::{env, fmt::Display, num::NonZeroUsize, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL used when issuing signed download links.
    pub public_base_url: String,
    pub signing_secret: String,
    /// Bucket used by bulk optimization and stats when none is given.
    pub default_bucket: String,
    /// Prefix scanned by bulk optimization and stats when none is given.
    pub bulk_prefix: String,
    /// Origin fronted by the edge cache under `/web/*`.
    pub web_origin: Option<String>,
    /// Version tag baked into edge cache partition names.
    pub cache_version: String,
    /// Entries kept per edge cache partition before the least recently used is evicted.
    pub cache_max_entries: NonZeroUsize,
    pub optimizer: OptimizerConfig,
}

/// Target encoding for optimized derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Webp,
    Jpeg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Jpeg => "image/jpeg",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Ok(Self::Webp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(format!("unsupported output format `{}`", other)),
        }
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Settings of the image optimization pipeline.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
    /// Lossy WebP quality, 0 to 100.
    pub webp_quality: f32,
    pub output_format: OutputFormat,
    /// Marker prepended to derivative filenames.
    pub optimized_prefix: String,
    /// Case-insensitive path substrings that are never optimized.
    pub skip_patterns: Vec<String>,
}

impl OptimizerConfig {
    /// Reject settings the pipeline cannot run with. An empty prefix would
    /// make every derivative path equal its source path.
    pub fn validate(&self) -> Result<()> {
        if self.optimized_prefix.is_empty() {
            bail!("TRIPBASKET_OPTIMIZED_PREFIX must not be empty");
        }
        if self.max_width == 0 || self.max_height == 0 {
            bail!("derivative bounds must be positive");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("JPEG quality {} is outside 1..=100", self.jpeg_quality);
        }
        if !(0.0..=100.0).contains(&self.webp_quality) {
            bail!("WebP quality {} is outside 0..=100", self.webp_quality);
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            jpeg_quality: 80,
            webp_quality: 75.0,
            output_format: OutputFormat::Webp,
            optimized_prefix: "optimized_".into(),
            skip_patterns: ["favicon", "icon-", "launcher", "thumbnail_"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "TripBasket media service")]
pub struct Args {
    /// Host to bind to (overrides TRIPBASKET_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRIPBASKET_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides TRIPBASKET_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TRIPBASKET_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL for signed links (overrides TRIPBASKET_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Default bucket (overrides TRIPBASKET_DEFAULT_BUCKET)
    #[arg(long)]
    pub default_bucket: Option<String>,

    /// Web origin to front with the edge cache (overrides TRIPBASKET_WEB_ORIGIN)
    #[arg(long)]
    pub web_origin: Option<String>,

    /// Edge cache version tag (overrides TRIPBASKET_CACHE_VERSION)
    #[arg(long)]
    pub cache_version: Option<String>,

    /// Maximum derivative width (overrides TRIPBASKET_MAX_WIDTH)
    #[arg(long)]
    pub max_width: Option<u32>,

    /// Maximum derivative height (overrides TRIPBASKET_MAX_HEIGHT)
    #[arg(long)]
    pub max_height: Option<u32>,

    /// Derivative encoding (overrides TRIPBASKET_OUTPUT_FORMAT)
    #[arg(long, value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge already-parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_port = env_parse("TRIPBASKET_PORT", 3000u16)?;
        let defaults = OptimizerConfig::default();
        let env_max_width = env_parse("TRIPBASKET_MAX_WIDTH", defaults.max_width)?;
        let env_max_height = env_parse("TRIPBASKET_MAX_HEIGHT", defaults.max_height)?;
        let env_format = env_parse("TRIPBASKET_OUTPUT_FORMAT", defaults.output_format)?;
        let jpeg_quality = env_parse("TRIPBASKET_JPEG_QUALITY", defaults.jpeg_quality)?;
        let webp_quality = env_parse("TRIPBASKET_WEBP_QUALITY", defaults.webp_quality)?;
        let cache_max_entries =
            env_parse("TRIPBASKET_CACHE_MAX_ENTRIES", DEFAULT_PARTITION_CAPACITY)?;
        let skip_patterns = match env::var("TRIPBASKET_SKIP_PATTERNS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_lowercase)
                .collect(),
            Err(_) => defaults.skip_patterns,
        };

        let port = args.port.unwrap_or(env_port);

        // --- Merge ---
        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("TRIPBASKET_HOST", "0.0.0.0")),
            port,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_string("TRIPBASKET_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_string(
                    "TRIPBASKET_DATABASE_URL",
                    "sqlite://./data/meta/tripbasket.db",
                )
            }),
            public_base_url: args.public_base_url.unwrap_or_else(|| {
                env_string(
                    "TRIPBASKET_PUBLIC_BASE_URL",
                    &format!("http://localhost:{}", port),
                )
            }),
            signing_secret: env_string("TRIPBASKET_SIGNING_SECRET", "tripbasket-dev-secret"),
            default_bucket: args.default_bucket.unwrap_or_else(|| {
                env_string("TRIPBASKET_DEFAULT_BUCKET", "tripbasket-sctkxj.appspot.com")
            }),
            bulk_prefix: env_string("TRIPBASKET_BULK_PREFIX", "images/"),
            web_origin: args
                .web_origin
                .or_else(|| env::var("TRIPBASKET_WEB_ORIGIN").ok())
                .filter(|origin| !origin.is_empty()),
            cache_version: args
                .cache_version
                .unwrap_or_else(|| env_string("TRIPBASKET_CACHE_VERSION", "v1")),
            cache_max_entries,
            optimizer: OptimizerConfig {
                max_width: args.max_width.unwrap_or(env_max_width),
                max_height: args.max_height.unwrap_or(env_max_height),
                jpeg_quality,
                webp_quality,
                output_format: args.output_format.unwrap_or(env_format),
                optimized_prefix: env_string("TRIPBASKET_OPTIMIZED_PREFIX", "optimized_"),
                skip_patterns,
            },
        };
        cfg.optimizer.validate()?;
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
