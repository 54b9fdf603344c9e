use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	#[error("failed to create log pipe")]
	Pipe(#[source] nix::errno::Errno),

	#[error("failed to register log pipe with the runtime")]
	Register(#[source] io::Error),

	#[error("failed to read from log pipe")]
	Read(#[source] io::Error),
}
