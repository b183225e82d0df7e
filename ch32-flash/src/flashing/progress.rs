/// A structure to manage progress reporting during flashing.
///
/// This struct stores a handler closure which is called for every event
/// during the programming procedure, most notably once per flash block.
///
/// # Example
///
/// ```
/// use ch32_flash::FlashProgress;
///
/// // Print events
/// let progress = FlashProgress::new(|event| println!("Event: {:?}", event));
/// ```
pub struct FlashProgress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl FlashProgress {
    /// Create a new `FlashProgress` structure with a given `handler` to be
    /// called on events.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// A progress sink that reports each block to the log, with the
    /// percentage of the image written so far.
    pub fn log() -> Self {
        Self::new(|event| {
            if let ProgressEvent::ProgrammingBlock {
                address,
                bytes_programmed,
                total,
            } = event
            {
                tracing::info!(
                    "Writing at {:#010x}: {}% ({}/{} bytes)",
                    address,
                    bytes_programmed * 100 / total.max(1),
                    bytes_programmed,
                    total
                );
            }
        })
    }

    /// Emit a flashing progress event.
    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    /// Signalize that the programming procedure started.
    pub(super) fn started_programming(&self, total: usize) {
        self.emit(ProgressEvent::StartedProgramming { total });
    }

    /// Signalize that the next block is about to be erased and programmed.
    pub(super) fn programming_block(&self, address: u32, bytes_programmed: usize, total: usize) {
        self.emit(ProgressEvent::ProgrammingBlock {
            address,
            bytes_programmed,
            total,
        });
    }

    /// Signalize that the programming procedure completed successfully.
    pub(super) fn finished_programming(&self) {
        self.emit(ProgressEvent::FinishedProgramming);
    }

    /// Signalize that the programming procedure failed.
    pub(super) fn failed_programming(&self) {
        self.emit(ProgressEvent::FailedProgramming);
    }
}

/// Possible events during the flashing process.
///
/// If flashing works without problems, the events arrive in the following
/// order:
///
/// * `StartedProgramming`
/// * `ProgrammingBlock` for every block
/// * `FinishedProgramming`
///
/// If an error occurs in any stage, a `FailedProgramming` event is emitted
/// instead of `FinishedProgramming`, and no further events follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Programming of the image started.
    StartedProgramming {
        /// Total length of the image in bytes.
        total: usize,
    },
    /// A flash block is about to be erased and programmed.
    ProgrammingBlock {
        /// Start address of the block.
        address: u32,
        /// Bytes of the image completed before this block.
        bytes_programmed: usize,
        /// Total length of the image in bytes.
        total: usize,
    },
    /// Programming of the image completed successfully.
    FinishedProgramming,
    /// Programming of the image failed.
    FailedProgramming,
}
