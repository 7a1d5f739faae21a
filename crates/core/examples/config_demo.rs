//! Example demonstrating the configuration system
//!
//! Run with: cargo run --package ballad-core --example config_demo

use ballad_core::domain::config::{BalladConfig, ConfigManager};
use ballad_core::domain::equalizer::{Band, CascadedEqualizer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("ballad_core=debug,info")
        .init();

    println!("=== Ballad Configuration Demo ===\n");

    // 1. Factory defaults
    println!("1. Factory default configuration:");
    let mut config = BalladConfig::factory_default();
    println!(
        "   engine: {} Hz, {} channels, {} frames per block",
        config.engine.sample_rate, config.engine.channels, config.engine.block_size
    );
    println!(
        "   streaming: ring {} frames, low water {}, chunk {}",
        config.streaming.ring_capacity_frames,
        config.streaming.low_water_frames,
        config.streaming.read_chunk_frames
    );

    // 2. Tweak and save
    println!("\n2. Saving a tuned configuration...");
    config.equalizer.low.gain_db = 4.0;
    config.equalizer.high.gain_db = -2.5;
    let demo_dir = std::env::temp_dir().join("ballad-config-demo");
    let manager = ConfigManager::new(demo_dir.clone());
    manager.save(&config).await?;
    println!("   ✓ Saved to {}", manager.config_path().display());

    // 3. Load it back
    println!("\n3. Loading configuration...");
    let loaded = manager.load().await;
    for band in Band::ALL {
        let settings = loaded.equalizer.band(band);
        println!(
            "   {:>4}: {:7.1} Hz  Q {:.2}  {:+.1} dB",
            band, settings.frequency, settings.q, settings.gain_db
        );
    }

    // 4. Apply to an equalizer
    println!("\n4. Applying equalizer settings...");
    let eq = CascadedEqualizer::with_settings(None, &loaded.equalizer);
    let coeffs = eq.control().coefficients(Band::Low);
    println!("   low shelf b0={:.5} a1={:.5}", coeffs.b0, coeffs.a1);

    println!("\n=== Demo Complete ===");

    manager.clear().await?;
    std::fs::remove_dir_all(demo_dir)?;

    Ok(())
}
