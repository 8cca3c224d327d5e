/*!
 * Records internet radio live streams into files for a fixed amount of
 * time. Meant to be started from cron: one invocation, one show.
 */

pub mod config;
pub mod recorder;
