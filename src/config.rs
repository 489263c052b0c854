use std::{
    path::Path,
    sync::mpsc::{channel, Receiver},
};

use anyhow::Result;
use clap::Parser;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    // MSAA samples per eye target, default: 4, usage: --sample-count=4
    #[clap(long, value_parser, default_value_t = 4)]
    pub sample_count: u32,
    // Display refreshes per submitted frame, default: 1, usage: --swap-interval=1
    #[clap(long, value_parser, default_value_t = 1)]
    pub swap_interval: u32,
    // Requested CPU clock level 0-4, default: 2, usage: --cpu-level=2
    #[clap(long, value_parser, default_value_t = 2)]
    pub cpu_level: u32,
    // Requested GPU clock level 0-4, default: 3, usage: --gpu-level=3
    #[clap(long, value_parser, default_value_t = 3)]
    pub gpu_level: u32,
    // Render both eyes in one multiview pass when the GPU supports it, usage: --multiview=true
    #[clap(long, value_parser, default_value_t = false)]
    pub multiview: bool,
    // Run frame submission on a dedicated render thread, usage: --threaded-renderer=true
    #[clap(long, value_parser, default_value_t = false)]
    pub threaded_renderer: bool,
    // Display refresh rate reported to the engine, default: 72.0
    #[clap(long, value_parser, default_value_t = 72.0)]
    pub display_frequency: f32,
    // Configuration file to watch for live changes, usage: --config-file=config.json
    #[clap(short, long, value_parser)]
    pub config_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sample_count: 4,
            swap_interval: 1,
            cpu_level: 2,
            gpu_level: 3,
            multiview: false,
            threaded_renderer: false,
            display_frequency: 72.0,
            config_file: None,
        }
    }
}

//Notifications

pub struct ConfigContext {
    pub config_notifier: Option<Receiver<notify::Result<Event>>>,
    pub config_watcher: Option<RecommendedWatcher>,
    pub config_file: Option<String>,
    pub last_config: Option<AppConfig>,
}

impl ConfigContext {
    pub fn try_setup() -> Result<Option<ConfigContext>> {
        let config = AppConfig::parse();
        if let Some(config_file_path) = config.config_file {
            log::info!("Using config file: {}", config_file_path);
            let params = serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(
                config_file_path.clone(),
            )?))?;
            let (tx, rx) = channel();
            let mut watcher = notify::recommended_watcher(tx)?;
            watcher.watch(Path::new(&config_file_path), RecursiveMode::NonRecursive)?;
            return Ok(Some(ConfigContext {
                config_notifier: Some(rx),
                config_watcher: Some(watcher),
                config_file: Some(config_file_path),
                last_config: Some(params),
            }));
        }
        Ok(None)
    }

    pub fn update_config(&mut self) -> Result<()> {
        if let Some(config_file_path) = self.config_file.clone() {
            let params = serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(
                config_file_path,
            )?))?;
            self.last_config = Some(params);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::AppConfig;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sample_count, 4);
        assert_eq!(back.swap_interval, 1);
        assert_eq!(back.cpu_level, 2);
        assert_eq!(back.gpu_level, 3);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let back: AppConfig = serde_json::from_str(r#"{"multiview": true}"#).unwrap();
        assert!(back.multiview);
        assert_eq!(back.display_frequency, 72.0);
    }
}
