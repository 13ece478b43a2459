pub mod axis;
pub mod chunks;
pub mod layout;
pub mod ranker;
pub mod stats;
pub mod surface;

pub use axis::TimeAxis;
pub use chunks::{ChunkConfig, ChunkManager, ChunkWindow, ViewChange};
pub use layout::LayoutEngine;
pub use ranker::{LayoutError, LongestPath, RankedLayout};
pub use stats::SessionStats;
pub use surface::{batch, Edge, Extent, MemorySurface, Node, Point, Surface, SurfaceError};
