use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocError {
    #[error("region size 0x{size:x} is below the minimum of 0x{min:x}")]
    TooSmall { size: u64, min: u64 },
    #[error("region base must be aligned to 16 bytes")]
    Misaligned,
    #[error("region id {0:#x} is already registered")]
    RegistryCollision(u64),
    #[error("region magic did not match 0x{expected:x}, found 0x{found:x}")]
    BadMagic { expected: u64, found: u64 },
    #[error("double free detected at offset 0x{0:x}")]
    DoubleFree(u64),
    #[error("offset 0x{0:x} is out of bounds for this region")]
    OutOfBounds(u64),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("opening a storage file failed")]
    Open(#[source] std::io::Error),
    #[error("locking the control file failed")]
    Lock(#[source] std::io::Error),
    #[error("synchronizing a storage file failed")]
    Sync(#[source] std::io::Error),
    #[error("resizing a storage file failed")]
    Resize(#[source] std::io::Error),
    #[error("mapping a storage file failed")]
    Map(#[source] std::io::Error),
    #[error("protecting a mapped page failed")]
    Protect(#[source] std::io::Error),
    #[error("installing the dirty-page signal handler failed")]
    SignalHandler(#[source] std::io::Error),
    #[error("the OS page size ({found}) does not match the compiled page size ({expected})")]
    PageSizeMismatch { expected: usize, found: usize },
    #[error("control block magic was invalid and was not zero either")]
    BadControlBlock,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}
