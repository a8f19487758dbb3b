mod subdir;

pub use subdir::{SubdirProvisioner, DEFAULT_MOUNT_PATH};
