// Reads live data and stored trouble codes from a vehicle
//
// With no arguments a simulated adapter is used:
// ```
// RUST_LOG=debug cargo run --example read_vehicle
// ```
// Pass a serial port (and optionally a baud rate) to use a real adapter:
// ```
// cargo run --example read_vehicle -- /dev/ttyUSB0 38400
// ```

use obd_diagnostics::{
    ManagerEvent, ManagerOptions, ObdManager, TransportConfig,
    hardware::{serial::SerialSettings, simulation::SimulatorSettings},
};

fn main() {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(port) => TransportConfig::Serial(SerialSettings {
            port,
            baud_rate: args.next().and_then(|b| b.parse().ok()).unwrap_or(38_400),
        }),
        None => {
            let mut settings = SimulatorSettings::default();
            settings.vehicle.dtcs = vec!["P0301".parse().unwrap()];
            settings.vehicle.mil_on = true;
            TransportConfig::Simulator(settings)
        }
    };

    let manager = ObdManager::new(ManagerOptions::default(), |e: ManagerEvent| {
        if let ManagerEvent::StateChanged { old, new } = e {
            println!("[{old} -> {new}]")
        }
    });
    if let Err(e) = manager.connect(&config) {
        eprintln!("Could not connect: {e}");
        return;
    }
    println!("Adapter: {}", manager.adapter_version().unwrap_or_default());
    match manager.vin() {
        Ok(vin) => println!("VIN: {vin}"),
        Err(e) => println!("VIN not available: {e}"),
    }

    for (name, value) in [
        ("rpm", manager.rpm()),
        ("speed", manager.speed()),
        ("coolant", manager.coolant_temp()),
        ("load", manager.engine_load()),
        ("battery", manager.battery_voltage()),
    ] {
        match value {
            Ok(v) => println!("{v}"),
            Err(e) => println!("{name} failed: {e}"),
        }
    }

    match manager.read_dtcs() {
        Ok(report) => {
            println!(
                "MIL {}, {} stored codes",
                if report.status.mil_on { "on" } else { "off" },
                report.status.dtc_count
            );
            for code in report.codes {
                println!("  {code}");
            }
        }
        Err(e) => println!("Reading DTCs failed: {e}"),
    }
    manager.disconnect();
}
