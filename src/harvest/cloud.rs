use std::fs;

use async_trait::async_trait;

use super::PublicMapping;

/// Source of the instance addresses in a cloud environment.
///
/// Implementations typically query the provider's metadata service.
/// The trait keeps orchestration testable without network access and
/// lets other providers slot in.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    /// Returns the instance's local address and the public address
    /// mapped onto it.
    async fn discover(&self) -> anyhow::Result<PublicMapping>;
}

const HYPERVISOR_UUID: &str = "/sys/hypervisor/uuid";
const PRODUCT_UUID: &str = "/sys/devices/virtual/dmi/id/product_uuid";

/// Whether this host looks like an EC2 instance.
///
/// EC2 exposes a system UUID starting with `ec2`. Hosts that do not
/// look like one skip metadata discovery unless it is forced.
pub(crate) fn looks_like_cloud_host() -> bool {
    uuid_says_ec2(HYPERVISOR_UUID) || uuid_says_ec2(PRODUCT_UUID)
}

fn uuid_says_ec2(path: &str) -> bool {
    match fs::read_to_string(path) {
        Ok(uuid) => {
            let uuid = uuid.trim_start();
            uuid.starts_with("ec2") || uuid.starts_with("EC2")
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ec2_uuid_prefixes_are_detected() {
        let path = std::env::temp_dir().join("rustice-uuid-probe");
        let path = path.to_str().unwrap();
        fs::write(path, "ec2e1916-9099-7caf-fd21-012345abcdef\n").unwrap();
        assert!(uuid_says_ec2(path));
        fs::write(path, "EC2E1916-9099-7CAF-FD21-012345ABCDEF\n").unwrap();
        assert!(uuid_says_ec2(path));
        fs::write(path, "4c4c4544-0046-5310-8052-b4c04f395931\n").unwrap();
        assert!(!uuid_says_ec2(path));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn unreadable_uuid_is_not_a_cloud_host() {
        assert!(!uuid_says_ec2("/nonexistent/rustice-uuid"));
    }
}
