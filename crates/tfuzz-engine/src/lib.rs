#![doc = "Fuzzing orchestration engine for tfuzz."]

pub mod campaign;
pub mod case;
pub mod dedup;
pub mod oracle;
pub mod promotion;
pub mod retention;
pub mod round;
pub mod seed;
pub mod selector;

pub use campaign::*;
pub use case::*;
pub use dedup::*;
pub use oracle::*;
pub use promotion::*;
pub use retention::*;
pub use round::*;
pub use seed::*;
pub use selector::*;
