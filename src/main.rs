fn main() {
    plex_presence_lib::run();
}
