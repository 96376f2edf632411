mod agents;
mod envelopes;
mod invocation;
mod messaging;
mod support;
