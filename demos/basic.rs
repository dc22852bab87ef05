use tapo::{Credentials, Device, TapoConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ip = std::env::args().nth(1).unwrap_or_else(|| "192.168.0.100".into());
    let username = std::env::var("TAPO_USERNAME")?;
    let password = std::env::var("TAPO_PASSWORD")?;

    let device = Device::new(&ip, Credentials::new(username, password), TapoConfig::from_env())?;
    device.connect().await?;

    let info = device.get_info().await?;
    println!(
        "{} ({}) fw {} — on: {:?}",
        info.nickname.as_deref().unwrap_or("<unnamed>"),
        info.model,
        info.fw_ver,
        info.device_on
    );

    device.turn_on().await?;
    if device.capabilities().map(|caps| caps.energy_monitoring) == Some(true) {
        println!("current draw: {:.1} W", device.get_current_power().await?);
    }

    device.disconnect().await;
    Ok(())
}
