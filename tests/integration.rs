mod common;
mod health;
mod metrics;
mod send_as_agent;
