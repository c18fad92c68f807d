use state_machines::state_machine;

state_machine! {
    name: FileMachine,
    state: FileState,
    initial: Ready,
    states: [Ready, Decided, Chunked, Embedded, Persisted, Recorded, Failed],
    events {
        decide { transition: { from: Ready, to: Decided } }
        split { transition: { from: Decided, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        persist { transition: { from: Embedded, to: Persisted } }
        record { transition: { from: Persisted, to: Recorded } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Decided, to: Failed }
            transition: { from: Chunked, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: Persisted, to: Failed }
        }
    }
}

pub fn ready() -> FileMachine<(), Ready> {
    FileMachine::new(())
}
