/// Bounds applied while loading a pipe table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadLimits {
    /// Maximum bytes read from a table file.
    pub max_file_size: usize,
    /// Maximum number of pipe descriptors; pipe indices are `u8` on the wire.
    pub max_pipes: usize,
}

impl Default for LoadLimits {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024,
            max_pipes: u8::MAX as usize,
        }
    }
}
