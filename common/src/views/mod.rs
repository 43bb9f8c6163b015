//! Output views for the various functions within certkeeper.

mod activity;
pub use activity::*;

mod certificate;
pub use certificate::*;

mod defaults;
pub use defaults::*;

mod deploy;
pub use deploy::*;

mod renewal;
pub use renewal::*;
