pub use kestrel_dfir as dfir;
pub use kestrel_escape as escape;

pub use kestrel_dfir::Lifetime;
pub use kestrel_escape::{EscapeConfig, EscapeError, EscapeStats, compute_lifetimes};
