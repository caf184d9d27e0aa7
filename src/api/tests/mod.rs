use super::*;

mod unit;
