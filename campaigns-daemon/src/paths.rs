use std::path::{Path, PathBuf};

pub const STORE_FILE: &str = "store.json";
pub const CONFIG_FILE: &str = "config.yaml";
pub const ENGINE_SOCKET: &str = "engine.sock";

pub fn campaigns_root(home: &Path) -> PathBuf {
    home.join(".campaigns")
}

pub fn store_path(home: &Path) -> PathBuf {
    campaigns_root(home).join(STORE_FILE)
}

pub fn config_path(home: &Path) -> PathBuf {
    campaigns_root(home).join(CONFIG_FILE)
}

pub fn run_dir(home: &Path) -> PathBuf {
    campaigns_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(ENGINE_SOCKET)
}
