pub mod hash;
pub mod local;

pub use hash::compute_hash;
pub use local::LocalFileStorage;

pub fn get_extension_from_mime_type(mime_type: &str) -> &'static str {
    match mime_type.to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "bin",
    }
}

/// Directory holding every result object for a store.
pub fn store_results_prefix(store_id: &str) -> String {
    format!("results/{}", compute_hash(store_id))
}

pub fn result_key(store_id: &str, request_id: &str, mime_type: &str) -> String {
    let ext = get_extension_from_mime_type(mime_type);
    format!("{}/{request_id}.{ext}", store_results_prefix(store_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_key_hides_store_identifier() {
        let key = result_key("shop-a.myshopify.com", "req-1", "image/png");
        assert!(key.starts_with("results/"));
        assert!(key.ends_with("/req-1.png"));
        assert!(!key.contains("myshopify"));
    }

    #[test]
    fn unknown_mime_maps_to_bin() {
        assert_eq!(get_extension_from_mime_type("IMAGE/JPEG"), "jpg");
        assert_eq!(get_extension_from_mime_type("application/pdf"), "bin");
    }
}
