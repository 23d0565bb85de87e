use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};
use libdfork::DirtyProtocol;

#[derive(Parser, Debug)]
#[command(name = "dfork")]
#[command(version, about = "Copy-on-write image forking", long_about = None)]
pub struct Cli {
    /// Directory holding the object pool
    #[arg(long, env = "DFORK_STORE_DIR", default_value = "/var/lib/dfork")]
    pub store_dir: PathBuf,

    /// Object operations kept in flight by bulk remove/transfer
    #[arg(long, env = "DFORK_CONCURRENT_OPS", default_value_t = 10)]
    pub concurrent_ops: usize,

    /// Dirty-bit protocol revision (v2 or v3)
    #[arg(long, env = "DFORK_PROTOCOL", default_value = "v3")]
    pub protocol: DirtyProtocol,

    /// Suppress progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Program that attaches a prepared image to the block-device front-end
    #[arg(long, env = "DFORK_DEVICE_CMD")]
    pub device_cmd: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Image addressed by name or, with `--image-id`, by id.
#[derive(Args, Debug, Clone)]
pub struct ImageArg {
    #[arg(value_name = "IMAGE")]
    pub image: Option<String>,

    #[arg(long)]
    pub image_id: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Fork PARENT into a new image CHILD")]
    Create {
        #[arg(value_name = "PARENT")]
        parent: String,
        #[arg(value_name = "CHILD")]
        child: String,
    },
    #[command(about = "Remove the fork CHILD of PARENT and release the fork snapshot")]
    Remove {
        #[arg(value_name = "PARENT")]
        parent: String,
        #[arg(value_name = "CHILD")]
        child: String,
    },
    #[command(about = "Switch fork mode off and tear down the objects of an image")]
    Abort(ImageArg),
    #[command(about = "Show the dirty bit of an image")]
    Dirty(DirtyArgs),
    #[command(about = "Set, clear or reset the dirty bit of an image")]
    SetDirty(SetDirtyArgs),
    #[command(about = "Switch fork mode of an image on or off")]
    Switch(SwitchArgs),
    #[command(about = "Switch fork mode on and attach the image")]
    Map(ImageArg),
    #[command(about = "Reset dirty tracking, mark the image as a fork child and attach it")]
    Super(ImageArg),
    #[command(about = "Hand every materialized object over to the image")]
    Transfer(ImageArg),
    /// Manage images in the pool
    #[command(subcommand)]
    Image(ImageCommands),
}

#[derive(Args, Debug)]
pub struct DirtyArgs {
    #[command(flatten)]
    pub image: ImageArg,

    /// Block writers if the image is clean
    #[arg(long, conflicts_with = "unblock")]
    pub block_on_clean: bool,

    /// Lift a block armed by --block-on-clean
    #[arg(long)]
    pub unblock: bool,

    /// Do not answer from the client-side cache
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("action").required(true).args(["set", "clear", "reset"])))]
pub struct SetDirtyArgs {
    #[command(flatten)]
    pub image: ImageArg,

    #[arg(long)]
    pub set: bool,

    #[arg(long)]
    pub clear: bool,

    /// Drain the dirty locations and clear the dirty bit
    #[arg(long)]
    pub reset: bool,

    /// Object recorded as dirty location together with --set
    #[arg(long, requires = "set")]
    pub loc_oid: Option<String>,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("mode").required(true).args(["on", "off"])))]
pub struct SwitchArgs {
    #[command(flatten)]
    pub image: ImageArg,

    #[arg(long)]
    pub on: bool,

    #[arg(long)]
    pub off: bool,

    /// Apply to every image of the pool
    #[arg(long, conflicts_with_all = ["image", "image_id"])]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum ImageCommands {
    #[command(about = "Create an empty image")]
    Create {
        #[arg(value_name = "NAME")]
        name: String,
        /// Image size in bytes
        #[arg(long)]
        size: u64,
        /// Object size as a power of two
        #[arg(long, default_value_t = libdfork::lifecycle::DEFAULT_ORDER)]
        order: u8,
    },
    #[command(about = "Write bytes into one object of an image")]
    Write {
        #[command(flatten)]
        image: ImageArg,
        #[arg(long)]
        object: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        data: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_dirty() {
        let cli = Cli::try_parse_from([
            "dfork",
            "--store-dir",
            "/tmp/pool",
            "set-dirty",
            "disk",
            "--set",
            "--loc-oid",
            "0000000000000001",
        ])
        .unwrap();
        let Commands::SetDirty(args) = cli.command else {
            panic!("expected set-dirty");
        };
        assert!(args.set);
        assert_eq!(args.loc_oid.as_deref(), Some("0000000000000001"));
        assert_eq!(cli.protocol, DirtyProtocol::V3);
    }

    #[test]
    fn test_set_dirty_requires_one_action() {
        assert!(Cli::try_parse_from(["dfork", "set-dirty", "disk"]).is_err());
        assert!(Cli::try_parse_from(["dfork", "set-dirty", "disk", "--set", "--reset"]).is_err());
    }

    #[test]
    fn test_switch_all_rejects_image() {
        assert!(Cli::try_parse_from(["dfork", "switch", "--off", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["dfork", "switch", "disk", "--off", "--all"]).is_err());
        assert!(Cli::try_parse_from(["dfork", "switch", "disk"]).is_err());
    }
}
