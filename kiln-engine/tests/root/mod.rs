mod runner;

mod binding;
mod classifier;
mod conv;
mod gather;
mod plan_format;
mod profiles;
