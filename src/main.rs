use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing::info;

use udavfs3::config::{CliArgs, MountConfig};
use udavfs3::db::Db;
use udavfs3::fuse_fs::UdavFs;
use udavfs3::meta::MetaStore;

fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let mount = MountConfig::parse(&args.options)?;
    let fsid = udavfs3::fsid(&mount.fsname);
    info!(fsname = %mount.fsname, %fsid, "starting udavfs3");

    // Detach before any threads exist; the runtime comes after.
    udavfs3::daemon::daemonize()?;

    let rt = tokio::runtime::Runtime::new().context("build runtime")?;
    let store = rt.block_on(async {
        let db = Db::connect(&args.database).await?;
        MetaStore::open(db, fsid, mount.blocksize, mount.fssize).await
    })?;

    let mut options = vec![
        MountOption::FSName("udavfs3".to_string()),
        MountOption::CUSTOM("nonempty".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
    ];
    for opt in &mount.passthrough {
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    let fs = UdavFs::new(store, rt.handle().clone());
    info!(mountpoint = %args.mountpoint.display(), "entering main loop");

    // Blocks until unmount; an error propagates to a non-zero exit after
    // the session guard closes the bridge.
    fuser::mount2(fs, &args.mountpoint, &options)
        .with_context(|| format!("FUSE mount at {:?}", args.mountpoint))?;

    info!("clean shutdown");
    Ok(())
}
