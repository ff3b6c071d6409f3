/// The version of the portunix binary.
pub(crate) fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
