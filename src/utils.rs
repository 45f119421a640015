use rand::Rng;
use reqwest::Url;

/// Generate a camera name for configs that don't provide one
pub fn generated_name() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("camera-{:08x}", suffix)
}

/// Strip userinfo from a URL before it reaches the logs
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which carry no userinfo anyway
                let _ = url.set_username("");
                let _ = url.set_password(None);
            }
            url.to_string()
        }
        Err(_) => raw.to_owned(),
    }
}
