use std::io::{self, Write};

use receiptprinter::btle::BtleTransport;
use receiptprinter::{PrinterHandle, SessionConfig};

/// Example: Interactive receipt printer session
/// - Scans for BLE printers
/// - Lets user select device
/// - Prints text lines (size///text prefix supported) until 'q'
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (transport, events) = BtleTransport::new().await?;
    let printer = PrinterHandle::spawn(transport, events, SessionConfig::default());

    if !printer.is_bluetooth_enabled().await? {
        println!("Bluetooth is off. Turn it on and try again.");
        return Ok(());
    }

    println!("Scanning for BLE printers for 5 seconds...");
    let devices = printer.scan_devices().await?;
    if devices.is_empty() {
        println!("No devices found. Make sure the printer is powered on and advertising.");
        return Ok(());
    }

    println!("Found devices:");
    for (i, d) in devices.iter().enumerate() {
        println!(
            "  {}) id={} name={}",
            i + 1,
            d.identifier,
            d.display_name.as_deref().unwrap_or("(unnamed)")
        );
    }

    let mut input = String::new();
    let chosen = loop {
        print!("Select device number to connect to (1-{}): ", devices.len());
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        if let Ok(n) = input.trim().parse::<usize>() {
            if n >= 1 && n <= devices.len() {
                break &devices[n - 1];
            }
        }
        println!("Invalid selection.");
    };

    println!("Connecting to {} ...", chosen.identifier);
    printer.connect(&chosen.identifier).await?;
    println!("Connected.");

    loop {
        print!("Text to print (\"3///big text\" sets size 1-5, 'q' quits): ");
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        let line = input.trim();
        if line.is_empty() {
            continue;
        }
        if line == "q" {
            break;
        }
        match printer.print_formatted_text(&format!("{line}\n")).await {
            Ok(()) => println!("Printed."),
            Err(e) => eprintln!("Print failed: {e}"),
        }
    }

    printer.disconnect().await?;
    println!("Disconnected.");
    Ok(())
}
