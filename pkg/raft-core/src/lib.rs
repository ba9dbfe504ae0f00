#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
		}

		errors {
			/// The module detected state corruption (e.g. a conflict with an already
			/// commited entry) and refuses to make further progress. Only a restart
			/// with repaired storage recovers from this.
			Shutdown {
				description("consensus module is shut down")
				display("consensus module is shut down")
			}

			/// An asynchronous storage or transport operation reported a failure and
			/// the triggering operation should be retried by the caller
			IoFailed {
				description("asynchronous storage or transport operation failed")
				display("asynchronous storage or transport operation failed")
			}

			Internal(msg: String) {
				description("internal invariant violated")
				display("internal invariant violated: {}", msg)
			}
		}
	}
}

pub mod protos;
pub mod wire;
pub mod config;
pub mod config_state;
pub mod state_machine;
pub mod log;
pub mod state;
pub mod constraint;
pub mod io;
pub mod consensus;
