use core::fmt::Write;

use heapless::String;

use super::{ModuleParams, SetupStep, COMMAND_MAX_LENGTH};

/// SIM800 family (SIM800, SIM800C, SIM808).
///
/// GPRS-class part using the `AT+CSTT`/`AT+CIICR` bring-up path. With
/// `AT+CIPMUX=1` the close notification arrives as `0, CLOSED`.
#[derive(Debug, Clone, Copy)]
pub struct Sim800;

impl ModuleParams for Sim800 {
    const CLOSE_TOKEN: &'static str = "0, CLOSED";
    const MAX_RECEIVE_SIZE: u16 = 1460;
    const SETUP: &'static [SetupStep] = &[
        SetupStep::Command("AT"),
        SetupStep::Command("ATE0"),
        SetupStep::Command("AT+CPIN?"),
        SetupStep::Command("AT+CSQ"),
        SetupStep::Command("AT+CREG?"),
        SetupStep::DefineApn,
        SetupStep::Command("AT+CIICR"),
        SetupStep::Command("AT+CGATT=1"),
        SetupStep::Command("AT+CIPMUX=1"),
        SetupStep::Command("AT+CIPRXGET=1"),
    ];

    fn apn_command(apn: &str) -> Option<String<COMMAND_MAX_LENGTH>> {
        let mut cmd = String::new();
        write!(cmd, "AT+CSTT=\"{}\"", apn).ok()?;
        Some(cmd)
    }
}
