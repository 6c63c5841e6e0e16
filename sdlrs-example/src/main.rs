mod config;
mod downlink;
mod logging;
mod uplink;

use std::net::UdpSocket;
use std::path::PathBuf;

use clap::Parser;
use log::info;

use crate::downlink::{spawn_packet_forwarder, DownlinkReader};
use crate::logging::setup_logger;
use crate::uplink::{spawn_ack_logger, spawn_cop1_monitor, spawn_frame_writer, TcServer, Uplink};

#[derive(Parser, Debug)]
#[command(about = "Ground station example: CCSDS frames over UDP")]
struct Cli {
    /// Path of the configuration file.
    #[arg(short, long, default_value = "sdlrs.toml")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let config = config::load(&cli.config).expect("loading the configuration failed");
    setup_logger(
        config.log.level_filter().expect("invalid log level"),
        config.log.file.as_deref(),
    )
    .expect("setting up logging with fern failed");
    println!("Running sdlrs ground station example");

    let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
    let uplink = Uplink::new(&config.uplink, ack_tx).expect("starting the FOP-1 engines failed");
    info!(
        "uplink with {} virtual channels, scheme {:?}",
        uplink.handles.len(),
        uplink.mux.scheme()
    );

    let (packet_tx, packet_rx) = crossbeam_channel::bounded(1024);
    let downlink_socket =
        UdpSocket::bind(config.network.downlink_bind).expect("binding the downlink socket failed");
    let downlink_reader = DownlinkReader::new(
        &config.downlink,
        downlink_socket,
        &uplink.handles,
        packet_tx,
    )
    .expect("configuring the downlink socket failed");

    let command_socket =
        UdpSocket::bind(config.network.command_bind).expect("binding the command socket failed");
    let tc_server = TcServer::new(command_socket, uplink.handles.clone());

    let mut threads = Vec::new();
    threads.push(spawn_ack_logger(ack_rx).expect("creating the ack logger thread failed"));
    threads.push(
        spawn_cop1_monitor(&uplink.handles).expect("creating the COP-1 monitor thread failed"),
    );
    threads.push(
        spawn_packet_forwarder(
            packet_rx,
            UdpSocket::bind("0.0.0.0:0").expect("binding the packet socket failed"),
            config.network.packet_out,
        )
        .expect("creating the packet forwarder thread failed"),
    );
    threads.push(
        downlink_reader
            .spawn()
            .expect("creating the downlink thread failed"),
    );
    threads.push(tc_server.spawn().expect("creating the TC server thread failed"));
    let Uplink {
        mux,
        engine_threads,
        ..
    } = uplink;
    threads.push(
        spawn_frame_writer(
            mux,
            UdpSocket::bind("0.0.0.0:0").expect("binding the uplink socket failed"),
            config.network.uplink_out,
            config.network.cltu,
            config.network.randomize,
        )
        .expect("creating the uplink writer thread failed"),
    );
    info!(
        "downlink frames on {}, commands on {}",
        config.network.downlink_bind, config.network.command_bind
    );
    threads.extend(engine_threads);
    for thread in threads {
        thread.join().expect("joining thread failed");
    }
}
