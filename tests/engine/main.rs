mod support;

mod distribution_client;
mod ecr_client;
mod runner;
