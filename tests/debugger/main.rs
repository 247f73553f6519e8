#![cfg(feature = "int_test")]

mod breakpoints;
mod common;
mod control;
