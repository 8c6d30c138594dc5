use super::lab::LabStatus;

pub fn can_transition_to(from: LabStatus, to: LabStatus) -> bool {
    use LabStatus::*;
    match (from, to) {
        (Creating, Starting) => true,
        (Starting, Running) => true,
        (Running, Stopping) => true,
        (Paused, Stopping) => true,
        (Stopping, Stopped) => true,
        (Running, Paused) => true,
        (Paused, Running) => true,
        (from, Error) => !from.is_terminal(),
        _ => false,
    }
}
