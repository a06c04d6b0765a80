use state_machines::state_machine;

state_machine! {
    name: CollectionMachine,
    state: CollectionState,
    initial: Initializing,
    states: [Initializing, Distributing, Collecting, Reporting, Done, Failed],
    events {
        validate { transition: { from: Initializing, to: Distributing } }
        distribute { transition: { from: Distributing, to: Collecting } }
        collect { transition: { from: Collecting, to: Reporting } }
        report { transition: { from: Reporting, to: Done } }
        reject { transition: { from: Initializing, to: Failed } }
    }
}

pub fn initializing() -> CollectionMachine<(), Initializing> {
    CollectionMachine::new(())
}

