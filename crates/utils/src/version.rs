use std::sync::LazyLock;

/// Defines the application version.
///
/// `IMAGE_VERSION` is stamped by the image build; local builds report `dev`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}",
        env!("CARGO_PKG_VERSION"),
        option_env!("IMAGE_VERSION").unwrap_or("dev")
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_package_version() {
        assert!(VERSION.starts_with(env!("CARGO_PKG_VERSION")));
    }
}
