//! A self-contained mesh simulation.
//!
//! Runs a gateway, a repeater and two sensor nodes over the in-process mesh:
//! - sensor readings flow to an MQTT broker on localhost:1883 once one is
//!   reachable, and buffer while it is not
//! - the operator console listens on 0.0.0.0:4050; connect with
//!   `nc 127.0.0.1 4050` and try `status`, `nodes refresh`, `ping 2001`
//!   or `ping 2001 3001`
//! - `reboot` restarts the gateway in place while the rest of the mesh
//!   keeps running
//!
//! Run with `cargo run --example sim`, `RUST_LOG=meshgate=debug` for detail.

use futures::future::select_all;
use meshgate::{
    ConsoleServer, Gateway, GatewayConfig, InProcessMesh, MeshTransport, MqttLink, NodeAgent,
    Result, Shutdown,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing_subscriber::EnvFilter;

const GATEWAY_ID: u32 = 1;
const REPEATER_ID: u32 = 2001;
const READING_PERIOD: Duration = Duration::from_secs(10);

fn spawn_repeater(mesh: &InProcessMesh, tasks: &mut Vec<JoinHandle<Result<()>>>) {
    let (transport, events) = mesh.join(REPEATER_ID);
    tasks.push(tokio::spawn(NodeAgent::new(transport, "Repeater", "None").run(events)));
}

/// A sensor node: the usual agent duties plus a periodic reading broadcast.
fn spawn_sensor(
    mesh: &InProcessMesh,
    id: u32,
    kind: &str,
    start: f64,
    tasks: &mut Vec<JoinHandle<Result<()>>>,
) {
    let (transport, events) = mesh.join(id);
    let emitter = transport.clone();
    tasks.push(tokio::spawn(NodeAgent::new(transport, "Sensor", kind).run(events)));

    let field = kind.to_lowercase();
    tasks.push(tokio::spawn(async move {
        let mut tick = time::interval(READING_PERIOD);
        let mut value = start;
        loop {
            tick.tick().await;
            value += 0.1;
            let reading = format!(r#"{{"{}":{:.1}}}"#, field, value);
            emitter.broadcast(&reading)?;
        }
    }));
}

/// Binds the console listener, waiting out the previous incarnation's
/// socket when rebooting.
async fn bind_console(addr: SocketAddr) -> Result<ConsoleServer> {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    loop {
        match ConsoleServer::bind(addr).await {
            Ok(server) => return Ok(server),
            Err(e) if time::Instant::now() >= deadline => return Err(e),
            Err(_) => time::sleep(Duration::from_millis(50)).await,
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshgate=info")),
        )
        .init();

    let config = GatewayConfig::default();
    let mesh = InProcessMesh::new();

    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();
    spawn_repeater(&mesh, &mut tasks);
    spawn_sensor(&mesh, 3001, "Temperature", 21.5, &mut tasks);
    spawn_sensor(&mesh, 3002, "Humidity", 48.0, &mut tasks);

    println!("broker expected on {}:{} (readings buffer until it appears)",
        config.broker_host, config.broker_port);

    let station: IpAddr = "127.0.0.1".parse()?;
    let gateway_mesh = mesh.clone();
    tasks.push(tokio::spawn(async move {
        // `reboot` ends one incarnation; the loop brings up the next.
        loop {
            let console = bind_console(config.console_addr).await?;
            println!("console listening on {}", console.local_addr()?);
            let (transport, events) = gateway_mesh.join(GATEWAY_ID);
            transport.set_station_addr(Some(station));
            let broker = MqttLink::new(&config.broker_host, config.broker_port);
            let gateway =
                Gateway::new(config.clone(), transport, broker, events, console.start());
            match gateway.run().await? {
                Shutdown::Reboot => println!("gateway rebooting"),
                Shutdown::Quit => {
                    println!("mesh event stream closed");
                    return Ok(());
                }
            }
        }
    }));

    println!("simulation running, Ctrl+C to stop");
    let (result, _index, _remaining) = select_all(tasks).await;
    match result {
        Ok(Ok(())) => println!("simulation finished"),
        Ok(Err(e)) => println!("task error: {}", e),
        Err(e) => println!("task join error: {}", e),
    }
    Ok(())
}
