use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use libdfork::lifecycle::{ImageService, OpenFlags};
use libdfork::request::SwitchTarget;
use libdfork::store::localfs::LocalFsStore;
use libdfork::{DforkClient, DforkConfig, ImageIdentity};
use tracing::{debug, info};

use crate::cli::{Cli, Commands, DirtyArgs, ImageArg, ImageCommands, SetDirtyArgs, SwitchArgs};

type Client = DforkClient<LocalFsStore>;

impl ImageArg {
    fn identity(&self) -> anyhow::Result<ImageIdentity> {
        let name = self.image.clone().unwrap_or_default();
        let id = self.image_id.clone().unwrap_or_default();
        Ok(ImageIdentity::new(name, id)?)
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = LocalFsStore::open(&cli.store_dir)
        .await
        .with_context(|| format!("error opening pool {}", cli.store_dir.display()))?;
    debug!(pool = %cli.store_dir.display(), protocol = %cli.protocol, "opened object pool");
    let config = DforkConfig {
        concurrent_management_ops: cli.concurrent_ops,
        protocol: cli.protocol,
        no_progress: cli.no_progress,
        device_cmd: cli.device_cmd,
        ..DforkConfig::default()
    };
    let client = DforkClient::new(Arc::new(store), config);

    match cli.command {
        Commands::Create { parent, child } => {
            let parent = ImageIdentity::by_name(parent)?;
            client
                .fork_create(&parent, &child)
                .await
                .context("error creating dfork child")?;
            Ok(())
        }
        Commands::Remove { parent, child } => {
            let parent = ImageIdentity::by_name(parent)?;
            client
                .fork_remove(&parent, &child)
                .await
                .context("error removing dfork child")
        }
        Commands::Abort(image) => {
            client
                .fork_abort(&image.identity()?)
                .await
                .context("error aborting dfork")?;
            info!("dfork aborted");
            Ok(())
        }
        Commands::Dirty(args) => dirty(&client, args).await,
        Commands::SetDirty(args) => set_dirty(&client, args).await,
        Commands::Switch(args) => switch(&client, args).await,
        Commands::Map(image) => client
            .fork_map(&image.identity()?)
            .await
            .context("error mapping image"),
        Commands::Super(image) => client
            .fork_super(&image.identity()?)
            .await
            .context("error preparing dfork child"),
        Commands::Transfer(image) => {
            let summary = client
                .transfer(&image.identity()?)
                .await
                .context("error transferring objects")?;
            println!("transferred {} objects, skipped {}", summary.done, summary.skipped);
            Ok(())
        }
        Commands::Image(cmd) => image(&client, cmd).await,
    }
}

async fn dirty(client: &Client, args: DirtyArgs) -> anyhow::Result<()> {
    let image = args.image.identity()?;
    if args.unblock {
        return client
            .unblock_dirty(&image)
            .await
            .context("error unblocking dfork dirty updates");
    }
    let dirty = client
        .check_dirty(&image, args.block_on_clean, args.no_cache)
        .await
        .context("error checking the dfork dirty bit")?;
    println!("{dirty}");
    Ok(())
}

async fn set_dirty(client: &Client, args: SetDirtyArgs) -> anyhow::Result<()> {
    let image = args.image.identity()?;
    if args.reset {
        client
            .reset_dirty(&image)
            .await
            .context("error resetting dfork dirty")?;
        return Ok(());
    }
    let dirty = u8::from(args.set);
    client
        .set_dirty(&image, dirty, args.loc_oid)
        .await
        .context("error setting the dfork dirty bit")
}

async fn switch(client: &Client, args: SwitchArgs) -> anyhow::Result<()> {
    let target = if args.all {
        SwitchTarget::All
    } else {
        SwitchTarget::Image(args.image.identity()?)
    };
    client
        .switch(target, args.on, false)
        .await
        .context("error switching dfork mode")
}

async fn image(client: &Client, cmd: ImageCommands) -> anyhow::Result<()> {
    match cmd {
        ImageCommands::Create { name, size, order } => {
            let info = client
                .images()
                .create(&name, size, order)
                .await
                .context("error creating image")?;
            println!("{}", info.id);
            Ok(())
        }
        ImageCommands::Write {
            image,
            object,
            offset,
            data,
        } => {
            let mut handle = client
                .images()
                .open(&image.identity()?, OpenFlags::empty())
                .await
                .context("error opening image")?;
            client
                .images()
                .write_object(&mut handle, object, offset, Bytes::from(data.into_bytes()))
                .await
                .context("error writing image object")
        }
    }
}
