//! Correlation token generation: `RAY-<8 hex>`, propagated through events,
//! block-page URLs and resolver logs.

use uuid::Uuid;

pub const FAIL_CLOSED_RAY_ID: &str = "RAY-fail-closed";

pub fn new_ray_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("RAY-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_id_has_expected_shape() {
        let ray = new_ray_id();
        assert!(ray.starts_with("RAY-"));
        assert_eq!(ray.len(), "RAY-".len() + 8);
        assert!(ray["RAY-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ray_ids_are_unique() {
        assert_ne!(new_ray_id(), new_ray_id());
    }
}
