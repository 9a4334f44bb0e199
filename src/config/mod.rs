use std::path::PathBuf;

use clap::Parser;

/// Minimum filesystem capacity accepted at creation.
const MIN_FSSIZE: u64 = 4 * 1024 * 1024;

/// UdavFS: POSIX filesystem stored in a shared SQL database.
#[derive(Parser, Debug)]
#[command(
    name = "udavfs3",
    about = "Mount a database-backed POSIX filesystem",
    arg_required_else_help = true
)]
pub struct CliArgs {
    /// Connection string for the Postgres-compatible server.
    pub database: String,

    /// Directory to mount the filesystem at.
    pub mountpoint: PathBuf,

    /// Comma-separated mount options (fsname=... is mandatory).
    #[arg(short = 'o', value_name = "OPTIONS", required = true)]
    pub options: String,
}

/// Parsed `-o` option string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Logical filesystem name; its SHA-1 digest scopes every row.
    pub fsname: String,
    /// Block size in bytes. Required on first mount, ignored afterwards.
    pub blocksize: Option<u64>,
    /// Declared capacity in bytes, already scaled by the size suffix.
    pub fssize: Option<u64>,
    /// Unrecognized options, handed to the kernel bridge verbatim.
    pub passthrough: Vec<String>,
}

impl MountConfig {
    /// Parse a comma-separated option string: `key=value` or bare `key`.
    /// `fsname` is mandatory; `blocksize` and `fssize` are validated here
    /// but only required at first mount (the store decides).
    pub fn parse(options: &str) -> anyhow::Result<Self> {
        let mut fsname = None;
        let mut blocksize = None;
        let mut fssize = None;
        let mut passthrough = Vec::new();

        for opt in options.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (opt, None),
            };
            match (key, value) {
                ("fsname", Some(v)) => fsname = Some(v.to_string()),
                ("blocksize", Some(v)) => {
                    let bs: u64 = v
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid blocksize {v:?}"))?;
                    if bs == 0 {
                        anyhow::bail!("blocksize must be positive");
                    }
                    blocksize = Some(bs);
                }
                ("fssize", Some(v)) => fssize = Some(parse_fssize(v)?),
                _ => passthrough.push(opt.to_string()),
            }
        }

        let fsname = fsname.ok_or_else(|| anyhow::anyhow!("missing mandatory option fsname="))?;
        Ok(Self {
            fsname,
            blocksize,
            fssize,
            passthrough,
        })
    }
}

/// Parse `<number><k|m|g|t>` into bytes. The suffix scales by powers of
/// 1024 and is required. The result must be at least 4 MiB.
fn parse_fssize(value: &str) -> anyhow::Result<u64> {
    let (digits, suffix) = value.split_at(value.len().saturating_sub(1));
    let scale: u64 = match suffix {
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        "t" => 1024u64 * 1024 * 1024 * 1024,
        _ => anyhow::bail!("fssize {value:?} must end in k, m, g or t"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid fssize {value:?}"))?;
    let bytes = n
        .checked_mul(scale)
        .ok_or_else(|| anyhow::anyhow!("fssize {value:?} overflows"))?;
    if bytes < MIN_FSSIZE {
        anyhow::bail!("fssize must be at least 4 MiB, got {bytes} bytes");
    }
    Ok(bytes)
}
