use clap::Parser;
use flowsync_controller::config::LflowCacheConfig;
use flowsync_controller::lflow_cache::LflowCache;
use flowsync_controller::netlink::LoopbackNetlink;
use flowsync_controller::unixctl::UnixctlServer;
use flowsync_controller::{transport, Controller, ControllerError, ControllerOptions};
use flowsync_db::DbSession;
use flowsync_types::tracing::error;
use std::path::PathBuf;
use std::process;

#[derive(Debug, Parser)]
#[command(name = "flowsyncd", about = "Hypervisor-local network control daemon")]
struct Cli {
    /// Chassis name; overrides the system-id-override file and the
    /// open-vswitch system-id.
    #[arg(long)]
    chassis: Option<String>,

    /// Directory holding system-id-override.
    #[arg(long, default_value = "/etc/flowsync")]
    sysconfdir: PathBuf,

    /// Control socket path.
    #[arg(long, default_value = "/var/run/flowsync/flowsyncd.ctl")]
    unixctl: PathBuf,

    /// Virtual-switch database endpoint.
    #[arg(long, default_value = "127.0.0.1:6640")]
    ovs_remote: String,

    /// Southbound database endpoint (normally discovered through
    /// `external_ids:ovn-remote`; this flag preempts it).
    #[arg(long, default_value = "127.0.0.1:6642")]
    sb_remote: String,

    /// OpenFlow control channel of the integration bridge.
    #[arg(long, default_value = "127.0.0.1:6653")]
    of_remote: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), ControllerError> {
    let cli = Cli::parse();

    // Everything that can fail fatally fails here, before the main loop.
    let unixctl = UnixctlServer::bind(&cli.unixctl)?;
    let boxed = |e: std::io::Error| -> ControllerError {
        ControllerError::Internal(Box::new(e))
    };
    let ovs_channels = transport::connect_db("vswitch", &cli.ovs_remote).map_err(boxed)?;
    let sb_channels = transport::connect_db("southbound", &cli.sb_remote).map_err(boxed)?;
    let (of_conn, of_events) = transport::connect_switch(&cli.of_remote).map_err(boxed)?;

    let engine = flowsync_controller::graph::build(
        cli.chassis.clone().unwrap_or_default(),
        LflowCache::new(LflowCacheConfig::default()),
    )?;
    let sb = DbSession::new(
        "southbound",
        sb_channels.inbox,
        sb_channels.txn_tx,
        sb_channels.cond_tx,
    );
    let ovs = DbSession::new(
        "vswitch",
        ovs_channels.inbox,
        ovs_channels.txn_tx,
        ovs_channels.cond_tx,
    );

    // Kernel route exchange attaches through the netlink collaborator;
    // without one, the loopback port keeps the subsystem converged.
    let (_netlink_tx, netlink_events) = crossbeam::channel::unbounded();

    let mut controller = Controller::new(
        engine,
        sb,
        ovs,
        Box::new(of_conn),
        of_events,
        Box::new(LoopbackNetlink::default()),
        netlink_events,
        ControllerOptions {
            chassis: cli.chassis,
            sysconfdir: cli.sysconfdir,
            unixctl: Some(unixctl),
        },
    );
    controller.run()
}
