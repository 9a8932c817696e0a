pub mod android_jni;
pub mod cache;
pub mod directions;
pub mod error;
pub mod geometry;
pub mod gpx;
pub mod instructions;
pub mod localizer;
pub mod marker;
pub mod matching;
pub mod polyline;
pub mod preprocess;
pub mod route_nav;
pub mod service;
pub mod stitch;
pub mod types;
pub mod units;

pub use error::{ErrorCode, MatchError};
pub use instructions::{InstructionContext, InstructionEngine, InstructionOptions, InstructionUpdate};
pub use localizer::{LocalizationResult, LocalizerOptions, RouteLocalizer};
pub use marker::{CarMarkerState, MarkerFilter, MarkerGuide, MarkerInput, MarkerMode, MarkerOptions};
pub use matching::{MapMatcher, MatchingOptions, ResolvedPackage};
pub use route_nav::PackageSource;
pub use service::{ReqwestTransport, Transport};
pub use types::{GeoPoint, NavPackage, Step};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
