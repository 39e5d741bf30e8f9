//! Record types stored in the circular buffer
//!
//! Every record type is a fixed-size `Copy` value that carries the timestamp of
//! its earliest frame, the number of frames packed into it and a per-type
//! nominal tick spacing between consecutive frames. Together these define the
//! nominal timestamp span a record covers, which is what the search strategies
//! operate on.

/// A fixed-size readout record that can be buffered and searched by timestamp
pub trait Readout: Copy + Default + Send + Sync + 'static {
    /// Nominal timestamp delta between two consecutive frames of this type
    const EXPECTED_TICK_DIFFERENCE: u64;

    /// Timestamp of the earliest frame in the record
    fn first_timestamp(&self) -> u64;

    /// Number of logical frames packed into the record
    fn frame_count(&self) -> u32;

    /// Whether the record carries irregular or erroneous frames
    fn has_errors(&self) -> bool;

    /// Nominal timestamp span covered by the record
    #[inline]
    fn span(&self) -> u64 {
        u64::from(self.frame_count()).saturating_mul(Self::EXPECTED_TICK_DIFFERENCE)
    }

    /// First timestamp past the nominal span of the record
    #[inline]
    fn end_timestamp(&self) -> u64 {
        self.first_timestamp().saturating_add(self.span())
    }

    /// Whether `timestamp` falls inside the nominal span of the record
    #[inline]
    fn contains(&self, timestamp: u64) -> bool {
        self.first_timestamp() <= timestamp && timestamp < self.end_timestamp()
    }
}

/// A superchunk of readout frames as delivered by one detector link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Superchunk {
    /// Timestamp of the first frame
    pub first_timestamp: u64,
    /// Number of valid frames in the chunk
    pub frame_count: u32,
    /// Error word per frame, zero means the frame is clean
    pub frame_errors: [u16; Superchunk::FRAMES],
    /// Opaque frame payload
    pub payload: [u8; Superchunk::PAYLOAD_SIZE],
}

impl Superchunk {
    /// Frames packed into one superchunk
    pub const FRAMES: usize = 12;

    /// Bytes of opaque payload per superchunk
    pub const PAYLOAD_SIZE: usize = 32;

    /// Tick spacing between two frames
    pub const TICK_DIFFERENCE: u64 = 25;

    /// Create a clean, fully populated superchunk starting at `first_timestamp`
    pub fn new(first_timestamp: u64) -> Self {
        Self {
            first_timestamp,
            frame_count: Self::FRAMES as u32,
            ..Self::default()
        }
    }

    /// Timestamp of frame `index` inside the chunk
    pub fn frame_timestamp(&self, index: usize) -> u64 {
        self.first_timestamp + index as u64 * Self::TICK_DIFFERENCE
    }
}

impl Readout for Superchunk {
    const EXPECTED_TICK_DIFFERENCE: u64 = Self::TICK_DIFFERENCE;

    #[inline]
    fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    #[inline]
    fn frame_count(&self) -> u32 {
        self.frame_count
    }

    fn has_errors(&self) -> bool {
        let frames = (self.frame_count as usize).min(Self::FRAMES);
        self.frame_errors[..frames].iter().any(|word| *word != 0)
    }
}
