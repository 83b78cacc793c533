// One module per area: single stages, pipe wiring, failures, cancellation.
mod cancellation;
mod failures;
mod pipe_wiring;
mod single_stage;
