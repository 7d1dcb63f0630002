use dotenv::dotenv;

/// Load the env file named by `HARVEST_ENV_FILE`, else `.env` from the current
/// working directory, else `.env` at the project root.
pub fn ensure_dotenv() {
    if let Ok(explicit) = std::env::var("HARVEST_ENV_FILE") {
        if dotenv::from_filename(&explicit).is_ok() {
            return;
        }
    }
    if dotenv().is_ok() {
        return;
    }
    let root = env!("CARGO_MANIFEST_DIR");
    let candidate = format!("{}/.env", root);
    let _ = dotenv::from_filename(candidate);
}
